use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_success(msg: &str) {
    eprintln!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    eprintln!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    eprintln!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    eprintln!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

/// A titled block of `command  description` rows for the help screen.
pub struct GuideSection {
    title: String,
    rows: Vec<(String, String)>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, usage: &str, description: &str) -> Self {
        self.rows.push((usage.to_string(), description.to_string()));
        self
    }

    pub fn print(&self) {
        let width = self.rows.iter().map(|(u, _)| u.len()).max().unwrap_or(0);
        println!("\n {}", style(&self.title).bold().underlined());
        for (usage, description) in &self.rows {
            println!(
                "   {}  {}",
                style(format!("{:<width$}", usage, width = width)).green(),
                style(description).dim()
            );
        }
    }
}
