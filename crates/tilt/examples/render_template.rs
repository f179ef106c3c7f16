//! Render a template with the bundled demo scripts.
//!
//! ```text
//! cargo run -p tilt --example render_template -- "Hello {{name}}!" name=World
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use tilt::{EnvironmentConfig, TiltEnvironment, Value};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let template = args.next().unwrap_or_else(|| "Hello {{name}}!".to_string());
    let context: Vec<(Value, Value)> = args
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) => (Value::from(key), Value::from(value)),
            None => (Value::from(arg.as_str()), Value::from(true)),
        })
        .collect();

    let scripts = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scripts");
    tracing::info!("Tilt v{}", tilt::VERSION);
    let env = TiltEnvironment::new(EnvironmentConfig::with_script_root(scripts))
        .context("starting the template environment")?;

    let result = env
        .render("cli.tilt", &template, Some(Value::Map(context)), &[])
        .context("rendering")?;
    println!("{}", result.text);
    tracing::info!(includes = ?result.includes, "done");

    Ok(())
}
