// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bash command parsing for permission patterns.
//!
//! A command line is split into the simple commands it runs — across
//! pipelines, `&&`/`||`/`;` lists and subshells — each reduced to
//! `{name, subcommand, args}`.  Quoting is honored; variable and command
//! substitutions are kept as the opaque token `$?` so a substituted value
//! can never satisfy a concrete pattern.
//!
//! Pattern precedence when matching a command against a permission map:
//! `"name sub *"` > `"name *"` > `"name"` > `"*"`; first hit wins.

use smed_config::PermissionAction;
use std::collections::HashMap;

/// The opaque stand-in for `$VAR`, `${...}`, `$(...)` and backticks.
pub const OPAQUE: &str = "$?";

/// One simple command extracted from a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BashCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl BashCommand {
    /// The first argument that is not a flag, treated as the subcommand
    /// for two-level patterns like `"git push *"`.
    pub fn subcommand(&self) -> Option<&str> {
        self.args
            .iter()
            .map(String::as_str)
            .find(|a| !a.starts_with('-') && *a != OPAQUE)
    }

    /// The pattern an "always" approval of this command memoizes:
    /// the most specific shape that still generalizes over arguments.
    pub fn pattern(&self) -> String {
        match (self.subcommand(), self.args.is_empty()) {
            (Some(sub), _) => format!("{} {} *", self.name, sub),
            (None, false) => format!("{} *", self.name),
            (None, true) => self.name.clone(),
        }
    }
}

/// Parse a command line into the simple commands it would run.
pub fn parse_bash(command: &str) -> Vec<BashCommand> {
    let mut commands = Vec::new();
    for segment in split_commands(command) {
        if let Some(cmd) = parse_simple(&segment) {
            commands.push(cmd);
        }
    }
    commands
}

/// Pick the configured action for one command, most specific pattern first.
pub fn match_bash(
    map: &HashMap<String, PermissionAction>,
    cmd: &BashCommand,
    default: PermissionAction,
) -> PermissionAction {
    let mut candidates = Vec::with_capacity(4);
    if let Some(sub) = cmd.subcommand() {
        candidates.push(format!("{} {} *", cmd.name, sub));
    }
    candidates.push(format!("{} *", cmd.name));
    candidates.push(cmd.name.clone());
    candidates.push("*".to_string());

    for candidate in candidates {
        if let Some(action) = map.get(&candidate) {
            return *action;
        }
    }
    default
}

/// The action for a whole command line: the most restrictive action among
/// its simple commands (`deny` > `ask` > `allow`).
pub fn match_bash_command_line(
    map: &HashMap<String, PermissionAction>,
    commands: &[BashCommand],
    default: PermissionAction,
) -> PermissionAction {
    let mut result = PermissionAction::Allow;
    for cmd in commands {
        match match_bash(map, cmd, default) {
            PermissionAction::Deny => return PermissionAction::Deny,
            PermissionAction::Ask => result = PermissionAction::Ask,
            PermissionAction::Allow => {}
        }
    }
    if commands.is_empty() {
        return default;
    }
    result
}

// ─── Tokenizer ────────────────────────────────────────────────────────────────

/// Split a command line at `|`, `||`, `&&`, `;`, `&` and newlines, honoring
/// quotes and unwrapping subshell parentheses.
fn split_commands(input: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_backtick = false;
    // Bare `( ... )` subshells are unwrapped; `$( ... )` is a substitution
    // and stays inside the current segment for the token parser.
    let mut subshell_depth = 0u32;
    let mut subst_depth = 0u32;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double && !in_backtick => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '`' if !in_single => {
                in_backtick = !in_backtick;
                current.push(c);
            }
            '(' if !in_single && !in_double && !in_backtick => {
                if current.ends_with('$') || subst_depth > 0 {
                    subst_depth += 1;
                    current.push(c);
                } else {
                    subshell_depth += 1;
                }
            }
            ')' if !in_single && !in_double && !in_backtick => {
                if subst_depth > 0 {
                    subst_depth -= 1;
                    current.push(c);
                } else if subshell_depth > 0 {
                    subshell_depth -= 1;
                } else {
                    current.push(c);
                }
            }
            // `>&` / `&>` are redirections, not separators.
            '&' if !in_single
                && !in_double
                && !in_backtick
                && (current.ends_with('>') || chars.peek() == Some(&'>')) =>
            {
                current.push(c);
            }
            '|' | '&' | ';' | '\n'
                if !in_single && !in_double && !in_backtick && subst_depth == 0 =>
            {
                // Consume the second char of `||` / `&&`.
                if (c == '|' || c == '&') && chars.peek() == Some(&c) {
                    chars.next();
                }
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments.retain(|s| !s.trim().is_empty());
    segments
}

/// Parse one pipeline-free segment into a simple command.
fn parse_simple(segment: &str) -> Option<BashCommand> {
    let tokens = tokenize(segment);
    let mut words = Vec::new();
    let mut skip_next = false;
    for token in tokens {
        if skip_next {
            skip_next = false;
            continue;
        }
        // Redirections drop the operator and its target.
        if let Some(consumes_next) = parse_redirection(&token) {
            skip_next = consumes_next;
            continue;
        }
        words.push(token);
    }

    // Leading environment assignments (FOO=bar cmd ...) are not the command.
    let mut iter = words.into_iter().peekable();
    while matches!(iter.peek(), Some(w) if is_env_assignment(w)) {
        iter.next();
    }
    let name = iter.next()?;
    Some(BashCommand {
        name,
        args: iter.collect(),
    })
}

fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((key, _)) => {
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !key.chars().next().is_some_and(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// `Some(consumes_next)` when `token` is a redirection, with or without an
/// inline target (`> out` vs `>out`).
fn parse_redirection(token: &str) -> Option<bool> {
    let t = token.trim_start_matches(|c: char| c.is_ascii_digit());
    for op in [">>", ">&", ">", "<<", "<", "&>"] {
        if let Some(rest) = t.strip_prefix(op) {
            let takes_target = matches!(op, ">>" | ">" | "<<" | "<" | "&>");
            return Some(takes_target && rest.is_empty());
        }
    }
    None
}

/// Split one segment into words, resolving quotes and replacing
/// substitutions with [`OPAQUE`].
fn tokenize(segment: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_content = false;
    let mut chars = segment.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if has_content {
                    tokens.push(std::mem::take(&mut current));
                    has_content = false;
                }
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_content = true;
                }
            }
            '\'' => {
                has_content = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                has_content = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(esc) = chars.next() {
                                current.push(esc);
                            }
                        }
                        '$' => {
                            consume_substitution(&mut chars);
                            current.push_str(OPAQUE);
                        }
                        '`' => {
                            consume_until(&mut chars, '`');
                            current.push_str(OPAQUE);
                        }
                        _ => current.push(q),
                    }
                }
            }
            '$' => {
                has_content = true;
                consume_substitution(&mut chars);
                current.push_str(OPAQUE);
            }
            '`' => {
                has_content = true;
                consume_until(&mut chars, '`');
                current.push_str(OPAQUE);
            }
            _ => {
                has_content = true;
                current.push(c);
            }
        }
    }
    if has_content {
        tokens.push(current);
    }
    // A token that mixes literal text with a substitution is opaque as a
    // whole: "pre$?post" can expand to anything.
    tokens
        .into_iter()
        .map(|t| {
            if t.contains(OPAQUE) {
                OPAQUE.to_string()
            } else {
                t
            }
        })
        .collect()
}

/// Skip over `$VAR`, `${...}` or `$(...)` after the `$` was consumed.
fn consume_substitution(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    match chars.peek() {
        Some('{') => {
            chars.next();
            consume_until(chars, '}');
        }
        Some('(') => {
            chars.next();
            let mut depth = 1u32;
            for c in chars.by_ref() {
                match c {
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {
            while matches!(chars.peek(), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
                chars.next();
            }
        }
    }
}

fn consume_until(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, end: char) {
    for c in chars.by_ref() {
        if c == end {
            break;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(line: &str) -> BashCommand {
        let mut cmds = parse_bash(line);
        assert_eq!(cmds.len(), 1, "expected one command in {line:?}");
        cmds.remove(0)
    }

    // ── Simple parsing ────────────────────────────────────────────────────────

    #[test]
    fn parses_name_and_args() {
        let c = cmd("git push origin main");
        assert_eq!(c.name, "git");
        assert_eq!(c.args, vec!["push", "origin", "main"]);
        assert_eq!(c.subcommand(), Some("push"));
    }

    #[test]
    fn flags_are_not_subcommands() {
        let c = cmd("ls -la /tmp");
        assert_eq!(c.subcommand(), Some("/tmp"));
    }

    #[test]
    fn single_quotes_preserve_spaces() {
        let c = cmd("echo 'hello world'");
        assert_eq!(c.args, vec!["hello world"]);
    }

    #[test]
    fn double_quotes_preserve_spaces() {
        let c = cmd(r#"grep "two words" file.txt"#);
        assert_eq!(c.args, vec!["two words", "file.txt"]);
    }

    #[test]
    fn escaped_space_joins_words() {
        let c = cmd(r"cat my\ file.txt");
        assert_eq!(c.args, vec!["my file.txt"]);
    }

    #[test]
    fn env_assignment_prefix_is_skipped() {
        let c = cmd("RUST_LOG=debug cargo test");
        assert_eq!(c.name, "cargo");
        assert_eq!(c.subcommand(), Some("test"));
    }

    #[test]
    fn redirection_targets_are_dropped() {
        let c = cmd("echo hi > /tmp/out.txt");
        assert_eq!(c.args, vec!["hi"]);
    }

    #[test]
    fn stderr_merge_is_not_a_separator() {
        let c = cmd("make build 2>&1");
        assert_eq!(c.name, "make");
        assert_eq!(c.args, vec!["build"]);
    }

    // ── Pipelines, lists, subshells ───────────────────────────────────────────

    #[test]
    fn pipeline_yields_each_command() {
        let cmds = parse_bash("cat foo.txt | grep bar | wc -l");
        let names: Vec<&str> = cmds.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cat", "grep", "wc"]);
    }

    #[test]
    fn and_or_lists_yield_each_command() {
        let cmds = parse_bash("make build && make test || echo failed");
        let names: Vec<&str> = cmds.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["make", "make", "echo"]);
    }

    #[test]
    fn semicolons_split_commands() {
        let cmds = parse_bash("cd /tmp; ls");
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn subshell_commands_are_extracted() {
        let cmds = parse_bash("(cd /tmp && rm -f x)");
        let names: Vec<&str> = cmds.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cd", "rm"]);
    }

    // ── Substitutions are opaque ──────────────────────────────────────────────

    #[test]
    fn command_substitution_is_opaque() {
        let c = cmd("echo $(rm -rf /)");
        assert_eq!(c.args, vec![OPAQUE]);
    }

    #[test]
    fn backtick_substitution_is_opaque() {
        let c = cmd("echo `whoami`");
        assert_eq!(c.args, vec![OPAQUE]);
    }

    #[test]
    fn variable_expansion_is_opaque() {
        let c = cmd("rm $FILE");
        assert_eq!(c.args, vec![OPAQUE]);
        assert_eq!(c.subcommand(), None);
    }

    #[test]
    fn substitution_embedded_in_word_makes_whole_word_opaque() {
        let c = cmd("curl https://example.com/${PATH_SEGMENT}/x");
        assert_eq!(c.args, vec![OPAQUE]);
    }

    #[test]
    fn quoted_substitution_is_opaque() {
        let c = cmd(r#"echo "value: $(cat secret)""#);
        assert_eq!(c.args, vec![OPAQUE]);
    }

    // ── Patterns ──────────────────────────────────────────────────────────────

    #[test]
    fn pattern_prefers_subcommand_shape() {
        assert_eq!(cmd("git push origin").pattern(), "git push *");
        assert_eq!(cmd("ls -la").pattern(), "ls *");
        assert_eq!(cmd("pwd").pattern(), "pwd");
    }

    // ── Matching precedence ───────────────────────────────────────────────────

    fn map(entries: &[(&str, PermissionAction)]) -> HashMap<String, PermissionAction> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn name_sub_star_beats_name_star() {
        let m = map(&[
            ("git push *", PermissionAction::Ask),
            ("git *", PermissionAction::Allow),
        ]);
        assert_eq!(
            match_bash(&m, &cmd("git push origin"), PermissionAction::Ask),
            PermissionAction::Ask
        );
        assert_eq!(
            match_bash(&m, &cmd("git status"), PermissionAction::Ask),
            PermissionAction::Allow
        );
    }

    #[test]
    fn name_star_beats_bare_name() {
        let m = map(&[
            ("ls *", PermissionAction::Allow),
            ("ls", PermissionAction::Deny),
        ]);
        assert_eq!(
            match_bash(&m, &cmd("ls -la"), PermissionAction::Ask),
            PermissionAction::Allow
        );
        // No args: "ls *" still matches first by precedence order.
        assert_eq!(
            match_bash(&m, &cmd("ls"), PermissionAction::Ask),
            PermissionAction::Allow
        );
    }

    #[test]
    fn star_is_the_last_resort() {
        let m = map(&[("*", PermissionAction::Deny)]);
        assert_eq!(
            match_bash(&m, &cmd("anything at all"), PermissionAction::Ask),
            PermissionAction::Deny
        );
    }

    #[test]
    fn unmatched_command_uses_default() {
        let m = map(&[("git *", PermissionAction::Allow)]);
        assert_eq!(
            match_bash(&m, &cmd("rm -rf /"), PermissionAction::Ask),
            PermissionAction::Ask
        );
    }

    #[test]
    fn command_line_action_is_most_restrictive() {
        let m = map(&[
            ("cat *", PermissionAction::Allow),
            ("rm *", PermissionAction::Deny),
        ]);
        let cmds = parse_bash("cat a.txt && rm b.txt");
        assert_eq!(
            match_bash_command_line(&m, &cmds, PermissionAction::Allow),
            PermissionAction::Deny
        );
    }

    #[test]
    fn empty_command_line_uses_default() {
        assert_eq!(
            match_bash_command_line(&HashMap::new(), &[], PermissionAction::Ask),
            PermissionAction::Ask
        );
    }
}
