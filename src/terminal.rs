use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅", "[ok]");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️ ", "[!]");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌", "[x]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨", "*");

const BOX_WIDTH: usize = 64;
const BOX_H: &str = "─";
const BOX_V: &str = "│";
const BOX_BL: &str = "└";
const BOX_DIAMOND: &str = "◇";

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}

/// A bordered help section:
/// ```text
/// ◇ Title ─────────────────────────
/// │  run      Start the assistant
/// └─────────────────────────────────
/// ```
pub struct GuideSection {
    title: String,
    commands: Vec<(String, String)>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            commands: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.commands
            .push((name.to_string(), description.to_string()));
        self
    }

    pub fn print(self) {
        let bar_len = BOX_WIDTH.saturating_sub(self.title.chars().count() + 3);
        println!(
            "\n {} {} {}",
            style(BOX_DIAMOND).cyan(),
            style(&self.title).bold(),
            style(BOX_H.repeat(bar_len)).dim()
        );
        for (name, description) in &self.commands {
            println!(
                " {}  {:<12} {}",
                style(BOX_V).dim(),
                style(name).green(),
                description
            );
        }
        println!(" {}{}", style(BOX_BL).dim(), style(BOX_H.repeat(BOX_WIDTH)).dim());
    }
}
