use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

// `#[zbus::proxy]` generates `FaceCheckProxy` (async) and `FaceCheckProxyBlocking`.
#[zbus::proxy(
    interface = "org.facecheck.FaceCheck1",
    default_service = "org.facecheck.FaceCheck1",
    default_path = "/org/facecheck/FaceCheck1"
)]
trait FaceCheck {
    async fn verify_frames(&self, captured: &str, reference: &str) -> zbus::Result<String>;
    async fn verify_identity(&self, captured: &str, subject: &str) -> zbus::Result<String>;
    async fn check_presence(&self, image: &str) -> zbus::Result<String>;
    async fn enroll(&self, subject: &str, image: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facecheck", about = "Face presence and identity verification CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    /// Seconds to wait for the daemon to answer
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify that a captured photo shows the same person as a reference
    Verify {
        /// Captured photo
        captured: PathBuf,
        #[command(flatten)]
        against: Against,
    },
    /// Check whether a photo contains a face
    Check {
        image: PathBuf,
    },
    /// Store a photo as the reference face of a subject
    Enroll {
        /// Subject id (student or teacher)
        subject: String,
        image: PathBuf,
    },
    /// Show daemon status
    Status,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Against {
    /// Reference photo to compare against
    #[arg(long)]
    reference: Option<PathBuf>,
    /// Subject whose stored reference is compared against
    #[arg(long)]
    subject: Option<String>,
}

fn read_base64(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "image read");
    Ok(STANDARD.encode(bytes))
}

/// `success` field of a response envelope; `None` when the reply is not one.
fn envelope_success(reply: &serde_json::Value) -> Option<bool> {
    reply.get("success").and_then(serde_json::Value::as_bool)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let builder = if cli.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(cli.timeout))
        .build()
        .await
        .context("cannot connect to the message bus")?;
    let proxy = FaceCheckProxy::new(&conn).await?;

    let reply = match cli.command {
        Commands::Verify { captured, against } => {
            let captured = read_base64(&captured)?;
            match (against.reference, against.subject) {
                (Some(reference), _) => proxy.verify_frames(&captured, &read_base64(&reference)?).await,
                (None, Some(subject)) => proxy.verify_identity(&captured, &subject).await,
                (None, None) => anyhow::bail!("either --reference or --subject is required"),
            }
        }
        Commands::Check { image } => proxy.check_presence(&read_base64(&image)?).await,
        Commands::Enroll { subject, image } => proxy.enroll(&subject, &read_base64(&image)?).await,
        Commands::Status => proxy.status().await,
    }
    .context("facecheckd call failed (is the daemon running?)")?;

    let value: serde_json::Value = serde_json::from_str(&reply).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    Ok(match envelope_success(&value) {
        Some(false) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verify_requires_exactly_one_reference() {
        assert!(Cli::try_parse_from(["facecheck", "verify", "a.jpg"]).is_err());
        assert!(Cli::try_parse_from(["facecheck", "verify", "a.jpg", "--reference", "b.jpg", "--subject", "s1"]).is_err());
        let cli = Cli::try_parse_from(["facecheck", "--system", "verify", "a.jpg", "--subject", "s1"]).unwrap();
        assert!(cli.system);
        assert!(matches!(
            cli.command,
            Commands::Verify { against: Against { subject: Some(ref s), reference: None }, .. } if s == "s1"
        ));
    }

    #[test]
    fn test_envelope_success() {
        assert_eq!(envelope_success(&serde_json::json!({"success": false, "status_code": 404})), Some(false));
        assert_eq!(envelope_success(&serde_json::json!({"version": "0.1.0"})), None);
    }

    #[test]
    fn test_read_base64_missing_file() {
        assert!(read_base64(Path::new("/nonexistent/photo.jpg")).is_err());
    }
}
