use crate::cli::GlobalFlags;
use clap::Args;
use std::path::PathBuf;
use uvmdisk::{ScratchFormatter, ScratchSource, UtilityVm};

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Destination disk image
    #[arg(index = 1)]
    pub dest: PathBuf,

    /// Size in GB (rounded up to the configured minimum)
    #[arg(long, value_name = "GB")]
    pub size: Option<u32>,

    /// Scratch cache file (default: {home}/cache/scratch.vhdx)
    #[arg(long, value_name = "PATH", conflicts_with = "no_cache")]
    pub cache: Option<PathBuf>,

    /// Neither read nor seed the scratch cache
    #[arg(long)]
    pub no_cache: bool,
}

pub async fn execute(args: ProvisionArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let options = global.load_options()?;
    let guest = global.guest(&options);
    let vm = guest.as_ref().map(|g| g as &dyn UtilityVm);

    let cache = if args.no_cache {
        None
    } else {
        Some(args.cache.unwrap_or_else(|| options.scratch_cache_path()))
    };
    let size = args.size.unwrap_or(options.disk.min_size_gb);

    let formatter = ScratchFormatter::from_options(&options);
    if let Some(cache) = &cache
        && !formatter.is_cached_size(size)
    {
        tracing::info!(
            cache = %cache.display(),
            size_gb = size,
            "Size differs from the cached size class, cache not used"
        );
    }
    let provisioned = formatter
        .provision(vm, &args.dest, size, cache.as_deref())
        .await?;

    match &provisioned.source {
        ScratchSource::FromCache => println!(
            "{}: {}GB scratch disk copied from cache",
            provisioned.path.display(),
            provisioned.size_gb
        ),
        ScratchSource::Formatted { address, device } => println!(
            "{}: {}GB scratch disk formatted as {} (scsi {})",
            provisioned.path.display(),
            provisioned.size_gb,
            device,
            address
        ),
    }
    if provisioned.cache_seeded
        && let Some(cache) = &cache
    {
        println!("Seeded cache {}", cache.display());
    }

    Ok(())
}
