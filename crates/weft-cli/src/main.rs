use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use weft_backends::{default_runtime, DylibBackend, CONFIG_ENV};
use weft_core::prelude::*;
use weft_core::RuntimeConfig;

const ADD_SOURCE: &str = r#"
@kernel void add(const float *a, const float *b, float *out) {
  for (int i = 0; i < N; ++i; @tile(16, @outer, @inner)) {
    out[i] = a[i] + b[i];
  }
}
"#;

#[derive(Parser)]
#[command(
    name = "weft",
    about = "Weft device runtime CLI",
    long_about = "Inspect the device runtime: available backends and modes,\nconfiguration, and an end-to-end vector add on any mode.",
    version
)]
struct Cli {
    /// JSON runtime configuration (defaults to $WEFT_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show the runtime configuration and loaded backends
    Info,
    /// List every mode and whether a backend serves it
    Modes,
    /// List the devices each available mode can create
    Devices,
    /// Build and run a vector add: out[i] = a[i] + b[i]
    Demo {
        /// Device mode
        #[arg(long, default_value = "Serial")]
        mode: Mode,
        /// Number of elements
        #[arg(long, default_value = "4")]
        n: u64,
        /// Log the kernel build
        #[arg(long)]
        verbose: bool,
    },
    /// Validate a configuration file and try to load its backend libraries
    CheckConfig {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("WEFT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Info => cmd_info(load_config(cli.config)?),
        Commands::Modes => cmd_modes(load_config(cli.config)?),
        Commands::Devices => {
            print!("{}", default_runtime(load_config(cli.config)?).available_devices_report());
            Ok(())
        }
        Commands::Demo { mode, n, verbose } => cmd_demo(load_config(cli.config)?, mode, n, verbose),
        Commands::CheckConfig { path } => cmd_check_config(&path),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<RuntimeConfig> {
    let path = path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    let mut config = match path {
        Some(p) => RuntimeConfig::from_json_file(&p).with_context(|| format!("loading {}", p.display()))?,
        None => RuntimeConfig::default(),
    };
    config.apply_env().context("applying WEFT_* overrides")?;
    Ok(config)
}

fn cmd_info(config: RuntimeConfig) -> Result<()> {
    println!("weft v{}", env!("CARGO_PKG_VERSION"));
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);

    let rt = default_runtime(config);
    let config = rt.config();
    println!("\nBackends");
    for name in rt.backend_names() {
        println!("  {name}");
    }
    println!("\nConfiguration");
    println!("  default device:       {}", config.default_device);
    println!("  cross-device policy:  {:?}", config.cross_device_policy);
    println!("  verbose compilation:  {}", config.verbose_compilation);
    println!("  compiler:             {}", config.compiler.as_deref().unwrap_or("(backend default)"));
    println!("  compiler flags:       {}", config.compiler_flags.as_deref().unwrap_or(""));
    println!("\nElement types");
    let names: Vec<&str> = ElementType::ALL.iter().map(|t| t.name()).collect();
    println!("  {}", names.join(", "));
    Ok(())
}

fn cmd_modes(config: RuntimeConfig) -> Result<()> {
    let rt = default_runtime(config);
    let available = rt.available_modes();
    for mode in Mode::ALL {
        let mark = if available.contains(&mode) { "[x]" } else { "[ ]" };
        let kind = if mode.is_host() { "host" } else { "device" };
        println!("  {mark} {:<9} {kind}", mode.as_str());
    }
    Ok(())
}

fn cmd_demo(config: RuntimeConfig, mode: Mode, n: u64, verbose: bool) -> Result<()> {
    if n == 0 {
        bail!("--n must be at least 1");
    }
    let rt = default_runtime(config);
    rt.set_verbose_compilation(verbose);

    let dev = rt.create_device(mode, 0, 0)?;
    tracing::info!("vector add of {} elements on {}", n, mode);
    let options = KernelBuildOptions::new().define("N", n);
    let add = rt.build_kernel(dev, &KernelSource::inline(ADD_SOURCE), "add", Some(&options))?;

    let a: Vec<f32> = (1..=n).map(|i| i as f32).collect();
    let b: Vec<f32> = a.iter().map(|x| x * 10.0).collect();
    let a_mem = rt.malloc_with(dev, &a)?;
    let b_mem = rt.malloc_with(dev, &b)?;
    let out = rt.malloc(dev, ElementType::F32, n)?;

    let start = Instant::now();
    rt.run(add, &[a_mem.into(), b_mem.into(), out.into()])?;
    rt.finish(dev)?;
    let wall = start.elapsed();

    let result: Vec<f32> = rt.read_vec(out)?;
    let expected: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
    if result != expected {
        bail!("vector add produced {result:?}, expected {expected:?}");
    }

    let shown = result.len().min(8);
    println!("mode:            {}", rt.device_mode(dev)?);
    println!("out[..{shown}]:       {:?}", &result[..shown]);
    println!("kernel time:     {:.3}ms", rt.time_taken(add)?.as_secs_f64() * 1000.0);
    println!("wall time:       {:.3}ms", wall.as_secs_f64() * 1000.0);
    println!("bytes allocated: {}", rt.bytes_allocated(dev)?);
    println!("preferred dim:   {}", rt.preferred_dim_size(add)?);

    rt.free_device(dev)?;
    Ok(())
}

fn cmd_check_config(path: &std::path::Path) -> Result<()> {
    let config = RuntimeConfig::from_json_file(path).with_context(|| format!("loading {}", path.display()))?;
    println!("{}", config.to_json()?);

    let mut failures = 0;
    for lib in &config.backend_libraries {
        match DylibBackend::load(lib) {
            Ok(backend) => println!("  [x] {} ({})", lib.display(), backend_modes(&backend)),
            Err(e) => {
                failures += 1;
                tracing::warn!("{} failed to load: {}", lib.display(), e);
                println!("  [ ] {}: {e}", lib.display());
            }
        }
    }
    if failures > 0 {
        bail!("{failures} backend librar{} failed to load", if failures == 1 { "y" } else { "ies" });
    }
    Ok(())
}

fn backend_modes(backend: &DylibBackend) -> String {
    use weft_core::Backend;
    let modes: Vec<&str> = backend.modes().iter().map(|m| m.as_str()).collect();
    modes.join(", ")
}
