use crate::cli::GlobalFlags;
use anyhow::Context;
use clap::Args;
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uvmdisk::{DiskError, DiskKind, StreamBridge, UtilityVm};

#[derive(Args, Debug)]
pub struct Vhd2TarArgs {
    /// Disk image to export
    #[arg(index = 1)]
    pub source: PathBuf,

    /// Export a scratch disk already mounted in the guest at this path
    #[arg(long, value_name = "GUEST_PATH")]
    pub scratch_mount: Option<String>,

    /// Where to write the archive ("-" for stdout)
    #[arg(short, long, value_name = "FILE", default_value = "-")]
    pub output: String,
}

pub async fn execute(args: Vhd2TarArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let options = global.load_options()?;
    let guest = global.guest(&options);
    let vm = guest.as_ref().map(|g| g as &dyn UtilityVm);

    let kind = match args.scratch_mount {
        Some(guest_mount_path) => DiskKind::Scratch { guest_mount_path },
        None => DiskKind::ReadOnlyLayer,
    };

    let mut out: Box<dyn AsyncWrite + Send + Unpin> = if args.output == "-" {
        Box::new(tokio::io::stdout())
    } else {
        let file = tokio::fs::File::create(&args.output)
            .await
            .with_context(|| format!("failed to create {}", args.output))?;
        Box::new(file)
    };

    let bridge = StreamBridge::from_options(&options);
    let mut stream = bridge.disk_to_archive(vm, &args.source, kind).await?;

    if let Err(e) = tokio::io::copy(&mut stream, &mut out).await {
        // Errors raised by the export arrive wrapped in io::Error.
        return match DiskError::from_io(&e) {
            Some(disk_err) => Err(anyhow::anyhow!("{}", disk_err)),
            None => Err(anyhow::Error::new(e).context("failed to write archive")),
        };
    }
    out.flush().await?;

    tracing::info!(
        source = %args.source.display(),
        bytes = stream.bytes_transferred(),
        "Export complete"
    );
    Ok(())
}
