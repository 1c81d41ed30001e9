use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use gatekeeper::{
    AccessController, AccessRequest, AccessType, CoreConfig, DeviceStatus, EmergencyType,
    Modality, ModalityAlgorithm, NetworkType, RecognitionEngine, StrategyManager, UserStatus,
};
use gatekeeper::liveness::LivenessEngine;

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(about = "Multimodal biometric access decision service")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a demo user and run one access request end to end
    Demo {
        /// User id to enroll and authenticate
        #[arg(short, long, default_value = "1001")]
        user: u64,
        /// Door to request access to
        #[arg(short, long, default_value = "door-main")]
        door: String,
    },
    /// Print engine, strategy, and liveness status
    Status,
    /// Run the demo request while an emergency is active
    Emergency {
        #[arg(value_enum)]
        kind: EmergencyKind,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EmergencyKind {
    Fire,
    Earthquake,
    SecurityBreach,
    Lockdown,
}

impl From<EmergencyKind> for EmergencyType {
    fn from(kind: EmergencyKind) -> Self {
        match kind {
            EmergencyKind::Fire => EmergencyType::Fire,
            EmergencyKind::Earthquake => EmergencyType::Earthquake,
            EmergencyKind::SecurityBreach => EmergencyType::SecurityBreach,
            EmergencyKind::Lockdown => EmergencyType::Lockdown,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => CoreConfig::load_from_path(path)?,
        None => CoreConfig::default(),
    };

    let controller = build_controller(&config)?;

    match cli.command {
        Commands::Demo { user, door } => {
            run_demo(&controller, user, &door).await?;
        }
        Commands::Status => {
            let status = controller.status();
            println!("{}", serde_json::to_string_pretty(&status)?);
            println!(
                "{}",
                serde_json::to_string_pretty(&controller.engine().status())?
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&controller.engine().liveness().statistics())?
            );
        }
        Commands::Emergency { kind } => {
            controller.trigger_emergency(kind.into(), "manual trigger", "cli");

            for access_type in [AccessType::Exit, AccessType::Entry] {
                let decision = controller
                    .process_access_request(demo_request(2002, "door-main", access_type))
                    .await?;
                println!(
                    "{}: {} ({})",
                    access_type,
                    if decision.allowed { "GRANTED" } else { "DENIED" },
                    decision.reason
                );
            }

            controller.release_emergency("drill over", "cli");
        }
    }

    controller.shutdown();
    Ok(())
}

fn build_controller(config: &CoreConfig) -> Result<AccessController> {
    let liveness = Arc::new(LivenessEngine::new(config.liveness.clone()));
    let engine = RecognitionEngine::new(&config.engine, liveness);

    for modality in Modality::ALL {
        let params = config
            .engine
            .algorithms
            .get(modality.as_str())
            .cloned()
            .unwrap_or_default();
        engine.register(Arc::new(ModalityAlgorithm::new(modality)), &params)?;
    }

    let strategies = Arc::new(StrategyManager::with_default_catalog(config.strategy.clone()));
    Ok(AccessController::new(engine, strategies))
}

fn demo_sample(seed: usize) -> Vec<u8> {
    (0..512).map(|i| ((i * 31 + seed * 7) % 256) as u8).collect()
}

fn demo_request(user: u64, door: &str, access_type: AccessType) -> AccessRequest {
    AccessRequest {
        user_id: user,
        device_id: "terminal-1".to_string(),
        door_id: door.to_string(),
        access_type,
        location: "lobby".to_string(),
        device_type: "terminal".to_string(),
        network_type: NetworkType::Corporate,
        required_security_level: None,
        samples: vec![
            (Modality::Face, demo_sample(1)),
            (Modality::Fingerprint, demo_sample(2)),
        ],
        user_status: UserStatus::Active,
        device_status: DeviceStatus::Trusted,
    }
}

async fn run_demo(controller: &AccessController, user: u64, door: &str) -> Result<()> {
    println!("Enrolling user {}...", user);
    for (modality, seed) in [(Modality::Face, 1), (Modality::Fingerprint, 2)] {
        let result = controller
            .engine()
            .register_template(user, "terminal-1", modality, demo_sample(seed), false)
            .await?;
        println!(
            "  {}: {} ({})",
            modality,
            if result.success { "enrolled" } else { "rejected" },
            result.message
        );
    }

    println!("Requesting access to {}...", door);
    let decision = controller
        .process_access_request(demo_request(user, door, AccessType::Entry))
        .await?;

    println!(
        "Decision: {} (confidence {:.3} vs threshold {:.3}, strategy {:?}, risk {:?})",
        if decision.allowed { "GRANTED" } else { "DENIED" },
        decision.confidence,
        decision.threshold,
        decision.strategy_id,
        decision.risk_level
    );
    if let Some(duration) = decision.duration {
        println!("Door open for {}s", duration.as_secs());
    }
    Ok(())
}

fn setup_logging(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}
