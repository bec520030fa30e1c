use std::{io, process::ExitCode};
use tokio::signal;
use tracing::{debug, error, warn};

use dats_accel::{
    cli::{init_tracing, parse_args, Args},
    BtleplugClient, DatsSession, Result, VERSION,
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(code) => return ExitCode::from(code),
    };
    init_tracing(args.verbose);
    debug!("dats-accel {VERSION}");

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: &Args) -> Result<()> {
    let params = args.connection_params()?;
    let client = BtleplugClient::connect(&params, &args.timeouts()).await?;
    let mut session = DatsSession::new(client, args.session_config());

    let interrupted = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    session
        .run(&mut io::stdout(), args.format, interrupted)
        .await
}
