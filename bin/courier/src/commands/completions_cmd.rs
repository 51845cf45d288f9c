use clap::CommandFactory;
use clap_complete::{generate, Shell};

/// Write a completion script for the given shell to stdout.
pub async fn run(shell: &str) -> anyhow::Result<()> {
    let shell = match shell.to_lowercase().as_str() {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" | "ps" => Shell::PowerShell,
        "elvish" => Shell::Elvish,
        _ => {
            anyhow::bail!(
                "Unsupported shell: {}. Options: bash, zsh, fish, powershell, elvish",
                shell
            );
        }
    };

    let mut cmd = crate::Cli::command();
    generate(shell, &mut cmd, "courier", &mut std::io::stdout());

    eprintln!();
    eprintln!("# Usage:");
    match shell {
        Shell::Bash => {
            eprintln!(
                "#   courier completions bash > ~/.local/share/bash-completion/completions/courier"
            );
            eprintln!("#   or: eval \"$(courier completions bash)\"");
        }
        Shell::Zsh => {
            eprintln!("#   courier completions zsh > ~/.zfunc/_courier");
            eprintln!("#   Make sure fpath includes ~/.zfunc and run compinit");
        }
        Shell::Fish => {
            eprintln!("#   courier completions fish > ~/.config/fish/completions/courier.fish");
        }
        _ => {}
    }

    Ok(())
}
