use chrono::NaiveDate;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[clap(name = "agenda", version, about = "Appointment scheduling service")]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the background jobs until interrupted (default)
    Serve,

    /// Rebuild every staff member's availability once and print a summary
    Refresh,

    /// Record outcomes for one local day
    Scan {
        /// Day to scan (YYYY-MM-DD); defaults to yesterday
        #[clap(long)]
        date: Option<NaiveDate>,
    },

    /// Audit calendar events against booking records once
    Reconcile,

    /// Draw one coach from the bucket
    Draw {
        /// Restore the default weights instead of drawing
        #[clap(long)]
        reset: bool,
    },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default() {
        let cli = Cli::parse_from(["agenda"]);
        assert_eq!(cli.command(), Command::Serve);
    }

    #[test]
    fn scan_takes_an_iso_date() {
        let cli = Cli::parse_from(["agenda", "scan", "--date", "2026-10-18"]);
        assert_eq!(
            cli.command(),
            Command::Scan {
                date: NaiveDate::from_ymd_opt(2026, 10, 18)
            }
        );
        assert!(Cli::try_parse_from(["agenda", "scan", "--date", "18/10/2026"]).is_err());
    }

    #[test]
    fn draw_reset_flag() {
        let cli = Cli::parse_from(["agenda", "draw", "--reset"]);
        assert_eq!(cli.command(), Command::Draw { reset: true });
    }
}
