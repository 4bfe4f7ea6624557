use console::style;

/// User-facing output for a build. Diagnostics go to `tracing`; this is what
/// the person running the build reads.
pub trait Ui: Send + Sync {
    /// Announce a step.
    fn say(&self, message: &str);

    /// Output belonging to the current step, such as remote command output.
    fn message(&self, message: &str);

    fn error(&self, message: &str);
}

/// Writes to the terminal.
#[derive(Clone, Debug, Default)]
pub struct ConsoleUi;

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        println!("{} {}", style("==>").green().bold(), style(message).bold());
    }

    fn message(&self, message: &str) {
        println!("    {message}");
    }

    fn error(&self, message: &str) {
        eprintln!("{} {}", style("==>").red().bold(), style(message).red());
    }
}
