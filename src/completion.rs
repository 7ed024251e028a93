//! # Shell Completion Module
//!
//! Completion scripts generated from the clap definition in [`crate::cli`].
//!
//! ## Usage
//!
//! ```bash
//! rotation completion bash > ~/.local/share/bash-completion/completions/rotation
//! rotation completion zsh > ~/.config/zsh/completions/_rotation
//! rotation completion fish > ~/.config/fish/completions/rotation.fish
//! ```

use clap::CommandFactory;
use clap_complete::{generate, Shell as CompletionShell};
use std::io::{self, Write};

use crate::cli::{Args, Shell};

/// Convert our Shell enum to clap_complete's Shell enum
#[must_use]
pub fn shell_to_completion_shell(shell: Shell) -> CompletionShell {
    match shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    }
}

/// Write the completion script for `shell` to `out`.
pub fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut cmd = Args::command();
    let name = cmd.get_name().to_string();
    generate(shell_to_completion_shell(shell), &mut cmd, name, out);
}

/// Print the completion script for `shell` to stdout.
pub fn print_completions(shell: Shell) {
    write_completions(shell, &mut io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_conversion() {
        assert_eq!(shell_to_completion_shell(Shell::Bash), CompletionShell::Bash);
        assert_eq!(shell_to_completion_shell(Shell::Zsh), CompletionShell::Zsh);
        assert_eq!(shell_to_completion_shell(Shell::PowerShell), CompletionShell::PowerShell);
    }

    #[test]
    fn test_scripts_mention_subcommands() {
        for shell in [Shell::Bash, Shell::Fish, Shell::Zsh] {
            let mut out = Vec::new();
            write_completions(shell, &mut out);
            let script = String::from_utf8(out).unwrap();
            assert!(script.contains("rotation"), "{shell:?} script lacks the binary name");
            assert!(script.contains("rescan"), "{shell:?} script lacks subcommands");
        }
    }
}
