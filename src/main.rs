use r_chime::broker::{FinishCallback, Session, SessionOptions};
use r_chime::config::Settings;
use r_chime::error::ErrorKind;
use r_chime::init_app_dirs;
use r_chime::logging::{init_logging, LogFormat};
use r_chime::proplist::{self, Proplist};
use r_chime::server::{AlsaOutput, LocalServer, NullOutput, OutputSink, ServerConfig};
use r_chime::ui::Cli;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "r_chime::main";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::new();
    let args = &cli.args;

    init_logging(if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    })?;
    init_app_dirs()?;

    // Config file first, command line on top
    let config_path = args.config.clone().unwrap_or_else(Settings::default_path);
    let mut settings = Settings::load(&config_path)?;
    args.apply_to(&mut settings);
    settings.validate()?;
    debug!(target: LOG_TARGET, "Effective settings: {:?}", settings);

    let output: Arc<dyn OutputSink> = if settings.null_output {
        Arc::new(NullOutput::paced())
    } else {
        Arc::new(AlsaOutput::new(&settings.alsa_device))
    };
    let server = LocalServer::new(ServerConfig::with_output(output))?;

    let mut client = Proplist::new();
    client.sets(proplist::APPLICATION_NAME, &settings.application_name)?;
    client.sets(proplist::THEME_NAME, &settings.theme)?;
    client.sets(proplist::THEME_OUTPUT_PROFILE, &settings.output_profile)?;

    let session = Session::open_with(
        &server,
        SessionOptions {
            driver: settings.driver.clone(),
            device: settings.device.clone(),
            properties: client,
            resolver: None,
        },
    )?;

    let event = match args.event_properties(&settings) {
        Ok(event) => event,
        Err(e) => {
            cli.display_error(&e);
            session.close()?;
            return Err("Either --id or --file is required, with well-formed --property values".into());
        }
    };

    if args.cache {
        let cache_session = session.clone();
        let cache_event = event.clone();
        let result = tokio::task::spawn_blocking(move || cache_session.cache(&cache_event)).await?;
        session.close()?;
        result?;
        cli.display_cached(&event);
        return Ok(());
    }

    let mut failure: Option<ErrorKind> = None;
    for round in 1..=args.loops.max(1) {
        cli.display_playback(&event, round);

        let (tx, mut rx) = oneshot::channel();
        let callback: FinishCallback = Box::new(move |_id, outcome| {
            let _ = tx.send(outcome);
        });

        let play_session = session.clone();
        let play_event = event.clone();
        let submitted =
            tokio::task::spawn_blocking(move || play_session.play_with(round, &play_event, Some(callback)))
                .await?;
        if let Err(e) = submitted {
            cli.display_outcome(Err(e));
            failure = Some(e);
            break;
        }

        let outcome = tokio::select! {
            outcome = &mut rx => outcome.unwrap_or(Err(ErrorKind::Destroyed)),
            _ = tokio::signal::ctrl_c() => {
                info!(target: LOG_TARGET, "Interrupted, cancelling request {}", round);
                if let Err(e) = session.cancel(round) {
                    warn!(target: LOG_TARGET, "Cancel failed: {}", e);
                }
                rx.await.unwrap_or(Err(ErrorKind::Destroyed))
            }
        };
        cli.display_outcome(outcome);
        if let Err(e) = outcome {
            failure = Some(e);
            break;
        }
    }

    session.close()?;
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
