use crate::cli::GlobalFlags;
use anyhow::Context;
use clap::Args;
use std::path::PathBuf;
use tokio::io::AsyncRead;
use uvmdisk::{StreamBridge, UtilityVm};

#[derive(Args, Debug)]
pub struct Tar2VhdArgs {
    /// Destination disk image
    #[arg(index = 1)]
    pub dest: PathBuf,

    /// Tar archive to convert ("-" for stdin)
    #[arg(short, long, value_name = "FILE", default_value = "-")]
    pub input: String,
}

pub async fn execute(args: Tar2VhdArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let options = global.load_options()?;
    let guest = global.guest(&options);
    let vm = guest.as_ref().map(|g| g as &dyn UtilityVm);

    let mut archive: Box<dyn AsyncRead + Send + Unpin> = if args.input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        let file = tokio::fs::File::open(&args.input)
            .await
            .with_context(|| format!("failed to open {}", args.input))?;
        Box::new(file)
    };

    let bridge = StreamBridge::from_options(&options);
    let written = bridge
        .archive_to_disk(vm, &args.dest, archive.as_mut())
        .await?;

    println!("{}: {} bytes written", args.dest.display(), written);
    Ok(())
}
