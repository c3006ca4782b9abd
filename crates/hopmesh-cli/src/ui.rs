//! Terminal output for start-up and fatal errors.

use colored::Colorize;

/// Start-up banner: ">> hopmesh A5_1 on port 4000".
pub fn banner(group_id: &str, port: u16) {
    println!(
        "  {} {} {}",
        ">>".bright_cyan().bold(),
        "hopmesh".bold(),
        format!("{group_id} on port {port}").dimmed()
    );
}

/// Key-value display: "  Label:       value".
pub fn kv(label: &str, value: &str) {
    println!("  {:<13}{}", format!("{label}:"), value);
}

/// Print an error message.
pub fn error(msg: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}
