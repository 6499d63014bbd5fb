use clap::Parser;

/// Probe the default Metal device and optionally run a small matmul.
#[derive(Parser, Debug)]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
#[command(name = "bridge-probe", version, about)]
struct ProbeArgs {
    /// Print device info as JSON
    #[arg(long)]
    json: bool,

    /// Run a 2x3 * 3x2 matmul on the GPU and print the result
    #[arg(long)]
    demo: bool,

    /// JSON config file (defaults plus METAL_BRIDGE_* environment otherwise)
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[cfg(target_os = "macos")]
fn main() {
    use metal_bridge::{BridgeConfig, Device, Engine, Matrix};

    env_logger::init();
    let args = ProbeArgs::parse();

    let config = match &args.config {
        Some(path) => BridgeConfig::from_file(path),
        None => BridgeConfig::from_env(),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let device = Device::discover_default();
    if args.json {
        match serde_json::to_string_pretty(device.info()) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error serializing device info: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        println!("{}", device.info());
    }

    if !args.demo {
        return;
    }

    let run = || -> metal_bridge::Result<Vec<f32>> {
        let engine = Engine::with_device(device.clone(), config.clone())?;
        let a = engine.upload(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        let b = engine.upload(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0])?;
        let (mut c, _) = engine.matmul(
            &Matrix::packed(&a, 2, 3),
            &Matrix::packed(&b, 3, 2),
            false,
            false,
        )?;
        Ok(c.to_vec::<f32>())
    };
    match run() {
        Ok(c) => {
            println!("\n[1 2 3; 4 5 6] * [7 8; 9 10; 11 12] =");
            println!("  [{} {}]", c[0], c[1]);
            println!("  [{} {}]", c[2], c[3]);
        }
        Err(e) => {
            eprintln!("Demo failed: {}", e.diagnostic());
            std::process::exit(1);
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn main() {
    env_logger::init();
    let _args = ProbeArgs::parse();
    eprintln!("Error: {}", metal_bridge::BridgeError::DeviceUnavailable);
    std::process::exit(1);
}
