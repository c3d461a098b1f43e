//! Prints the SQL planned for one request
//!
//! ```text
//! cqn-service config.yaml request.json
//! ```
//!
//! The request is the JSON form of `cqn_odata::Request`; the output is the
//! compiled plan as JSON.

use cqn_odata::{Intent, Request};
use cqn_service::{logging, Config, Service};
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(request_path)) = (args.next(), args.next()) else {
        eprintln!("usage: cqn-service <config.yaml> <request.json>");
        std::process::exit(2);
    };

    let config = Config::load(&config_path)?;
    config.apply_logging_env();
    logging::init();
    let service = Service::load(config)?;
    info!(config = %config_path, "Service ready");

    let request: Request = serde_json::from_str(&std::fs::read_to_string(&request_path)?)?;
    let output = match request.intent {
        Intent::Read => serde_json::to_string_pretty(&service.read(&request)?)?,
        Intent::Invoke => serde_json::to_string_pretty(&service.invoke(&request)?)?,
        Intent::Create | Intent::Update | Intent::Delete => serde_json::to_string_pretty(&service.write(&request)?)?,
    };
    println!("{}", output);
    Ok(())
}
