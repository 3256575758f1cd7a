use console::{style, Emoji};

pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("✖", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✦", "");

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_step(msg: &str) {
    println!("{} {}", SPARKLE, style(msg).bold());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub struct GuideSection {
    title: &'static str,
    commands: Vec<(&'static str, &'static str)>,
}

impl GuideSection {
    pub fn new(title: &'static str) -> Self {
        Self {
            title,
            commands: Vec::new(),
        }
    }

    pub fn command(mut self, name: &'static str, description: &'static str) -> Self {
        self.commands.push((name, description));
        self
    }

    pub fn print(self) {
        println!("\n {}", style(self.title).bold().underlined());
        for (name, description) in self.commands {
            println!("   {:<12} {}", style(name).green(), description);
        }
    }
}
