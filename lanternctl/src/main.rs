//! Lantern command-line tool
//!
//! Sends one telecommand and prints its acknowledgment and reply data as JSON.
//!
//! Usage: `lanternctl <config.json> <command> [params-json] [timeout-secs]`
//!
//! `command` is a command name from the descriptor files (`get_version`) or
//! its numeric id (`5`).

use std::env;
use std::process;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use serde_json::json;

use lanternlib::config::constants::{DEFAULT_ACK_TIMEOUT, DEFAULT_REPLY_TIMEOUT};
use lanternlib::{load_config, CommandRecord, TransportContext, TransportDriver};
use lanternlibgs::{Fields, LanternError, LanternResult, Value};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args.len() > 5 {
        eprintln!(
            "Usage: {} <config.json> <command> [params-json] [timeout-secs]",
            args[0]
        );
        process::exit(1);
    }

    match run(&args[1..]) {
        Ok(record) => {
            println!("{}", report(&record));
            let rejected = matches!(record.outcome(), Some(Err(_)));
            if rejected {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run(args: &[String]) -> LanternResult<CommandRecord> {
    let config = load_config(&args[0])?;
    let params = match args.get(2) {
        Some(text) => parse_params(text)?,
        None => Fields::new(),
    };

    let context = TransportContext::new();
    let mut driver = TransportDriver::new(config, context.clone())?;
    let command_id = resolve_command(&driver, &args[1])?;

    let has_reply = driver.codec().schemas().has_reply(command_id);
    let timeout = match args.get(3) {
        Some(secs) => Duration::from_secs_f64(secs.parse::<f64>().map_err(|e| {
            LanternError::invalid_argument(format!("timeout '{}': {}", secs, e))
        })?),
        None if has_reply => DEFAULT_REPLY_TIMEOUT,
        None => DEFAULT_ACK_TIMEOUT,
    };

    driver.connect()?;
    driver.start_receiver()?;

    let packet = driver.command(command_id, params)?;
    info!("Sent command {} as packet {:?}", command_id, packet.packet_id());

    let ledger = driver.ledger();
    let waited = if has_reply {
        ledger.wait_last_reply(timeout, |replies| !replies.is_empty())
    } else {
        ledger.validate_last_tc(timeout).and_then(|_| {
            ledger.last_tc()?.ok_or(LanternError::NoCommand)
        })
    };

    // A rejection still has a record worth printing
    let record = match waited {
        Ok(record) => record,
        Err(LanternError::Rejected(name)) => {
            debug!("Command rejected with {}", name);
            ledger.last_tc()?.ok_or(LanternError::NoCommand)?
        }
        Err(e) => return Err(e),
    };

    driver.disconnect()?;
    context.terminate();
    Ok(record)
}

fn resolve_command(driver: &TransportDriver, command: &str) -> LanternResult<i64> {
    if let Ok(id) = command.parse::<i64>() {
        driver.codec().schemas().command(id)?;
        return Ok(id);
    }
    driver
        .codec()
        .schemas()
        .command_by_name(command)
        .map(|schema| schema.key)
        .ok_or_else(|| LanternError::invalid_argument(format!("unknown command '{}'", command)))
}

fn parse_params(text: &str) -> LanternResult<Fields> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    match Value::from(json) {
        Value::Map(fields) => Ok(fields),
        _ => Err(LanternError::invalid_argument("parameters must be a JSON object")),
    }
}

fn report(record: &CommandRecord) -> serde_json::Value {
    let replies: Vec<serde_json::Value> = record
        .replies
        .iter()
        .filter_map(|r| r.reply_data())
        .map(|data| Value::Map(data.clone()).to_json())
        .collect();
    json!({
        "packet_id": record.packet_id,
        "command_id": record.command_id,
        "error": record.ack.as_ref().and_then(|ack| ack.error_name()),
        "replies": replies,
        "reported_at": Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let fields = parse_params(r#"{"x": 1.5, "y": -2}"#).unwrap();
        assert_eq!(fields["x"], Value::Float(1.5));
        assert_eq!(fields["y"], Value::Int(-2));
        assert!(parse_params("[1, 2]").is_err());
        assert!(parse_params("{").is_err());
    }
}
