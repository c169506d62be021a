// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;

use anyhow::Result;
use clap::{value_parser, Arg, ArgMatches, Command};
use rand::Rng;
use relaycat::server::backend::ProxyStrategy;

mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");

  let app = Command::new("relaycat")
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("proxy-strategy")
        .long("proxy-strategy")
        .value_parser(["default", "destination-affinity"])
        .default_value("default")
        .help("How an agent is selected for each new dial"),
    )
    .arg(
      Arg::new("server-id")
        .long("server-id")
        .help("Identity reported to agents; random when omitted"),
    )
    .arg(
      Arg::new("server-count")
        .long("server-count")
        .value_parser(value_parser!(usize))
        .default_value("1")
        .help("Fleet size reported to agents"),
    )
    .arg(
      Arg::new("agent-bind")
        .long("agent-bind")
        .value_parser(value_parser!(SocketAddr))
        .default_value("127.0.0.1:8091")
        .help("Address accepting agent streams"),
    )
    .arg(
      Arg::new("proxy-bind")
        .long("proxy-bind")
        .value_parser(value_parser!(SocketAddr))
        .default_value("127.0.0.1:8090")
        .help("Address accepting frontend proxy streams"),
    )
    .arg(
      Arg::new("tunnel-bind")
        .long("tunnel-bind")
        .value_parser(value_parser!(SocketAddr))
        .default_value("127.0.0.1:8092")
        .help("Address accepting HTTP CONNECT tunnels"),
    );
  let matches = app.get_matches();

  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("relaycat-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  let result = server_arg_handling(&matches).and_then(|args| {
    tracing::info!(?args, "running server");
    rt.block_on(server::server_main(args))
  });
  match result {
    Err(err) => {
      tracing::error!(err = ?err, "server_exit_failure");
      std::process::exit(1);
    }
    Ok(()) => tracing::info!("server exited successfully"),
  }
}

fn server_arg_handling(args: &ArgMatches) -> Result<server::ServerArgs> {
  let strategy = args
    .get_one::<String>("proxy-strategy")
    .expect("defaulted")
    .parse::<ProxyStrategy>()
    .map_err(anyhow::Error::msg)?;
  let server_id = match args.get_one::<String>("server-id") {
    Some(id) => id.clone(),
    None => format!("{:016x}", rand::thread_rng().gen::<u64>()),
  };
  Ok(server::ServerArgs {
    strategy,
    server_id,
    server_count: *args.get_one::<usize>("server-count").expect("defaulted"),
    agent_bind: *args.get_one::<SocketAddr>("agent-bind").expect("defaulted"),
    proxy_bind: *args.get_one::<SocketAddr>("proxy-bind").expect("defaulted"),
    tunnel_bind: *args.get_one::<SocketAddr>("tunnel-bind").expect("defaulted"),
  })
}
