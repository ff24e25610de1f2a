use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static FILM: Emoji<'_, '_> = Emoji("🎬 ", "");
pub static HOURGLASS: Emoji<'_, '_> = Emoji("⏳ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}

pub fn print_generating(label: &str) {
    println!("{} {}", HOURGLASS, style(label).dim());
}

pub fn print_handoff(label: &str) {
    println!("{} {}", FILM, style(label).magenta());
}

/// Titled block of aligned rows, used by the help screen and reports.
pub struct GuideSection {
    title: String,
    rows: Vec<GuideRow>,
}

enum GuideRow {
    Command(String, String),
    Text(String),
    Blank,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.rows
            .push(GuideRow::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.rows.push(GuideRow::Text(text.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.rows.push(GuideRow::Blank);
        self
    }

    pub fn print(&self) {
        let width = self
            .rows
            .iter()
            .filter_map(|r| match r {
                GuideRow::Command(name, _) => Some(name.chars().count()),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        println!("\n {}", style(&self.title).bold().underlined());
        for row in &self.rows {
            match row {
                GuideRow::Command(name, description) => println!(
                    "   {}  {}",
                    style(format!("{:<width$}", name, width = width)).green(),
                    description
                ),
                GuideRow::Text(text) => println!("   {}", text),
                GuideRow::Blank => println!(),
            }
        }
    }
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "                    _ _        __ _               ",
        " _ __ ___   ___  __| (_) __ _ / _| | _____      __",
        "| '_ ` _ \\ / _ \\/ _` | |/ _` | |_| |/ _ \\ \\ /\\ / /",
        "| | | | | |  __/ (_| | | (_| |  _| | (_) \\ V  V / ",
        "|_| |_| |_|\\___|\\__,_|_|\\__,_|_| |_|\\___/ \\_/\\_/  ",
    ];

    // Gradient: #f472b6 → #fb923c → #facc15 (diagonal top-left → bottom-right)
    let stops: [(u8, u8, u8); 3] = [(244, 114, 182), (251, 146, 60), (250, 204, 21)];
    let max_w = 52u32;
    let max_d = max_w + 4 * 10;

    println!();
    for (y, line) in lines.iter().enumerate() {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let d = ((x as u32 + y as u32 * 10) * 1000 / max_d).min(1000);
            let (r, g, b) = if d <= 500 {
                lerp_color(stops[0], stops[1], d * 2)
            } else {
                lerp_color(stops[1], stops[2], (d - 500) * 2)
            };
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");

    println!("\x1b[38;2;250;204;21mFrom brief to cut, one graph at a time.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let r = (a.0 as u32 * (1000 - t) + b.0 as u32 * t) / 1000;
    let g = (a.1 as u32 * (1000 - t) + b.1 as u32 * t) / 1000;
    let b_val = (a.2 as u32 * (1000 - t) + b.2 as u32 * t) / 1000;
    (r as u8, g as u8, b_val as u8)
}

#[cfg(test)]
mod tests {
    use super::lerp_color;

    #[test]
    fn lerp_hits_both_ends() {
        assert_eq!(lerp_color((0, 0, 0), (200, 100, 50), 0), (0, 0, 0));
        assert_eq!(lerp_color((0, 0, 0), (200, 100, 50), 1000), (200, 100, 50));
        assert_eq!(lerp_color((0, 0, 0), (200, 100, 50), 500), (100, 50, 25));
    }
}
