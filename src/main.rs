use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Error;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use ostar_client::storage::{Backend, S3Backend};
use ostar_client::tools::S3Settings;
use ostar_client::Runner;

mod options;

async fn wait_for_shutdown() -> Result<(), Error> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => (),
    }
    Ok(())
}

fn run() -> Result<i32, Error> {
    let cli = options::Cli::parse_from(options::rewrite_legacy(std::env::args_os()));
    let run_options = cli.into_run_options()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let handle = rt.handle().clone();

    let mut runner = Runner::new(Box::new(std::io::stdout()), Box::new(std::io::stderr()))
        .with_lazy_object_store(move || {
            let settings = S3Settings::from_env()?;
            log::debug!("object store settings: {:?}", settings);
            let backend: Arc<dyn Backend> = Arc::new(S3Backend::new(handle.clone(), settings)?);
            Ok(backend)
        });

    let cancel = runner.cancel_flag();
    rt.spawn(async move {
        match wait_for_shutdown().await {
            Ok(()) => {
                log::warn!("received shutdown signal, stopping");
                cancel.store(true, Ordering::SeqCst);
            }
            Err(err) => log::error!("unable to listen for signals - {}", err),
        }
    });

    // the engine blocks on the runtime handle itself, so it must not run inside it
    let result = runner.run(&run_options);
    if let Some(err) = &result.error {
        eprintln!("ostar: {:#}", err);
    }
    Ok(result.exit_code())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("OSTAR_LOG", "warn"))
        .write_style(env_logger::WriteStyle::Never)
        .format_timestamp_millis()
        .init();

    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ostar: {:#}", err);
            2
        }
    };
    std::process::exit(code);
}
