use crate::demo::{run_demo, run_verify, DemoArgs, VerifyArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use clearance::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "No Dues Clearance",
    about = "Run and demonstrate the university no-dues clearance service",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Walk one application through rejection, reapplication, completion and verification
    Demo(DemoArgs),
    /// Check the structure of a scanned certificate QR payload
    Verify(VerifyArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Demo(args) => run_demo(args),
        Command::Verify(args) => run_verify(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["clearance-api"]).expect("parses");
        assert!(cli.command.is_none());
    }

    #[test]
    fn serve_accepts_bind_overrides() {
        let cli = Cli::try_parse_from([
            "clearance-api",
            "serve",
            "--host",
            "0.0.0.0",
            "--port",
            "8080",
        ])
        .expect("parses");
        match cli.command {
            Some(Command::Serve(args)) => {
                assert_eq!(args.host.as_deref(), Some("0.0.0.0"));
                assert_eq!(args.port, Some(8080));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn verify_requires_a_payload() {
        assert!(Cli::try_parse_from(["clearance-api", "verify"]).is_err());
        let cli =
            Cli::try_parse_from(["clearance-api", "verify", "--payload", "{}"]).expect("parses");
        assert!(matches!(cli.command, Some(Command::Verify(_))));
    }
}
