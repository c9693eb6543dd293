mod cli;

use ffpilot::config;
use fp_av::capabilities::{self, CatalogKind};
use fp_av::{FfmpegCommand, ToolLocator};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, RunArgs};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "ffpilot=debug,fp_av=debug,fp_core=debug".to_string()
        } else {
            "ffpilot=info,fp_av=info,fp_core=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run(args) => block_on(run_transcode(args, config_path)),
        Commands::Probe { file, json } => block_on(probe_file(&file, json, config_path)),
        Commands::CheckTools => check_tools(config_path),
        Commands::Capabilities { kind, json } => {
            block_on(list_capabilities(&kind, json, config_path))
        }
        Commands::Validate {
            config: validate_path,
        } => {
            let path = validate_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("ffpilot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(future)
}

fn locator(config_path: Option<&Path>) -> Result<ToolLocator> {
    let config = config::load_config_or_default(config_path)?;
    Ok(ToolLocator::new(config.tools))
}

async fn run_transcode(args: RunArgs, config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let mut cmd = FfmpegCommand::with_config(&config);

    for input in &args.inputs {
        cmd.input(input);
    }
    if args.overwrite {
        cmd.overwrite();
    }
    if let Some(codec) = &args.audio_codec {
        cmd.audio_codec(codec);
    }
    if let Some(codec) = &args.video_codec {
        cmd.video_codec(codec);
    }
    if let Some(size) = &args.size {
        cmd.size(size);
    }
    if let Some(format) = &args.format {
        cmd.format(format);
    }
    cmd.output_options(&args.options);
    cmd.output(&args.output);
    if args.flvmeta {
        cmd.flvmeta();
    }
    if let Some(secs) = args.timeout {
        cmd.timeout(Duration::from_secs(secs));
    }
    if let Some(niceness) = args.niceness {
        cmd.niceness(niceness);
    }
    if args.validate {
        cmd.validate_capabilities(true);
    }

    if args.dry_run {
        println!("ffmpeg {}", cmd.args()?.join(" "));
        return Ok(());
    }

    if args.progress {
        cmd.on_progress(|progress| {
            let percent = progress
                .percent
                .map(|p| format!("{p:5.1}%"))
                .unwrap_or_else(|| "  ?".to_string());
            eprint!("\r{percent} {}", progress.timemark);
            let _ = std::io::stderr().flush();
        });
    }

    let output = cmd
        .run()
        .await
        .with_context(|| format!("Transcoding to {} failed", args.output))?;

    if args.progress {
        eprintln!();
    }
    tracing::debug!("Run {} finished", output.run_id);
    println!("Wrote {}", args.output);

    Ok(())
}

async fn probe_file(file: &Path, json: bool, config_path: Option<&Path>) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let locator = locator(config_path)?;
    let metadata = fp_av::ffprobe(&locator, &file.to_string_lossy()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    if let Some(ref name) = metadata.format.format_name {
        println!("Container: {}", name);
    }
    if let Some(size) = metadata.format.size {
        println!("Size: {} bytes", size);
    }
    if let Some(duration) = metadata.duration() {
        let secs = duration as u64;
        println!(
            "Duration: {:02}:{:02}:{:02}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
    }

    let video: Vec<_> = metadata.video_streams().collect();
    println!("\nVideo Streams: {}", video.len());
    for stream in video {
        print!(
            "  [{}] {}",
            stream.index,
            stream.codec_name.as_deref().unwrap_or("unknown")
        );
        if let (Some(w), Some(h)) = (stream.width, stream.height) {
            print!(" {}x{}", w, h);
        }
        if let Some(fps) = stream.frame_rate {
            print!(", {:.3} fps", fps);
        }
        println!();
    }

    let audio: Vec<_> = metadata.audio_streams().collect();
    println!("\nAudio Streams: {}", audio.len());
    for stream in audio {
        print!(
            "  [{}] {}",
            stream.index,
            stream.codec_name.as_deref().unwrap_or("unknown")
        );
        if let Some(channels) = stream.channels {
            print!(" {}ch", channels);
        }
        if let Some(lang) = stream.language() {
            print!(" ({})", lang);
        }
        println!();
    }

    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let tools = locator(config_path)?.check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version);
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All tools are available!");
    } else {
        println!("Some tools are missing. Install them to enable all features.");
    }

    Ok(())
}

async fn list_capabilities(kind: &str, json: bool, config_path: Option<&Path>) -> Result<()> {
    let kind: CatalogKind = kind.parse()?;
    let locator = locator(config_path)?;
    let catalog = capabilities::catalog_json(&locator, kind).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    if let Some(entries) = catalog.as_object() {
        for (name, entry) in entries {
            let description = entry["description"].as_str().unwrap_or_default();
            println!("{:<24} {}", name, description);
        }
        println!("\n{} entries", entries.len());
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let (path, config) = match path {
        Some(p) => (Some(p.to_path_buf()), config::load_config(p)?),
        None => match config::default_config_path() {
            Some(p) => {
                let config = config::load_config(&p)?;
                (Some(p), config)
            }
            None => (None, config::Config::default()),
        },
    };

    match &path {
        Some(p) => println!("Validating config: {:?}", p),
        None => println!("No config file found, using defaults"),
    }

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        println!("Configuration has {} warning(s):", warnings.len());
        for warning in &warnings {
            println!("  ! {}", warning);
        }
    }

    println!("  Niceness: {}", config.run.niceness);
    match config.run.timeout_secs {
        Some(secs) => println!("  Timeout: {}s", secs),
        None => println!("  Timeout: none"),
    }
    println!("  Output close grace: {}ms", config.run.output_close_grace_ms);
    println!(
        "  Capability validation: {}",
        config.run.validate_capabilities
    );
    let tools = [
        ("ffmpeg", &config.tools.ffmpeg_path),
        ("ffprobe", &config.tools.ffprobe_path),
        ("flvmeta", &config.tools.flvmeta_path),
    ];
    for (name, path) in tools {
        match path {
            Some(p) => println!("  {}: {}", name, p.display()),
            None => println!("  {}: (lookup)", name),
        }
    }

    Ok(())
}
