//! b2bua-core main entrypoint.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

use b2bua_core::b2bua::B2buaEngine;
use b2bua_core::config::{Config, StoreBackend};
use b2bua_core::dialog_sync::DialogSync;
use b2bua_core::logging::setup_logging;
use b2bua_core::media_relay::MediaRelayClient;
use b2bua_core::routing::RoutingEngine;
use b2bua_core::session::SessionTracker;
use b2bua_core::sip::dialog::{Dialog, DialogId, DialogManager};
use b2bua_core::sip::transaction::{TransactionEvent, TransactionManager};
use b2bua_core::sip::transport::TransportLayer;
use b2bua_core::sip::TransportKind;
use b2bua_core::store::memory::MemoryStore;
use b2bua_core::store::SharedKvStore;
use b2bua_core::Result;

#[derive(Parser)]
#[command(name = "b2bua-core")]
#[command(about = "SIP Back-to-Back User Agent core")]
#[command(version = b2bua_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the B2BUA core (default).
    Start,
    /// Validate configuration and exit.
    ValidateConfig,
    /// Print a default configuration to stdout or a file.
    GenerateConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::ExitCode::from(3)
        }
    }
}

async fn run(cli: Cli) -> Result<std::process::ExitCode> {
    let config = match load_configuration(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return Ok(std::process::ExitCode::from(1));
        }
    };

    setup_logging(&config.logging)?;
    info!("starting {} v{}", b2bua_core::NAME, b2bua_core::VERSION);

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start_core(config).await,
        Commands::ValidateConfig => {
            println!("configuration is valid");
            Ok(std::process::ExitCode::SUCCESS)
        }
        Commands::GenerateConfig { output } => {
            generate_default_config(output)?;
            Ok(std::process::ExitCode::SUCCESS)
        }
    }
}

fn load_configuration(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load_from_env_or_default()?,
    };
    config.validate()?;
    Ok(config)
}

fn generate_default_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default_config();
    let toml_content = toml::to_string_pretty(&config).map_err(|e| b2bua_core::Error::internal(format!("failed to serialize config: {e}")))?;
    match output {
        Some(path) => std::fs::write(&path, toml_content)?,
        None => println!("{toml_content}"),
    }
    Ok(())
}

fn build_store(config: &Config) -> SharedKvStore {
    match &config.store.backend {
        StoreBackend::Memory => MemoryStore::new(),
        other => {
            warn!("store backend {other:?} has no client in this build; falling back to in-memory");
            MemoryStore::new()
        }
    }
}

async fn start_core(config: Config) -> Result<std::process::ExitCode> {
    let store = build_store(&config);

    let (transport, tcp_listener, tls_listener) = match TransportLayer::bind(
        &config.sip.listen_host,
        config.sip.udp_port,
        config.sip.tcp_port,
        config.sip.tls_port,
        config.sip.tls_cert_path.as_deref(),
        config.sip.tls_key_path.as_deref(),
        config.sip.tls_ca_path.as_deref(),
    )
    .await
    {
        Ok(triple) => triple,
        Err(e) => {
            error!("failed to bind SIP listeners: {e}");
            return Ok(std::process::ExitCode::from(2));
        }
    };

    let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
    let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::unbounded_channel();
    transport.spawn_udp(inbound_tx.clone(), out_rx, config.sip.t4());
    TransportLayer::spawn_tcp(tcp_listener, inbound_tx.clone(), config.sip.t4());
    if let (Some(listener), Some(acceptor)) = (tls_listener, transport.tls_acceptor()) {
        TransportLayer::spawn_tls(listener, acceptor, inbound_tx, config.sip.t4());
    }

    let (transactions, mut tx_events) = TransactionManager::new(config.sip.clone(), out_tx);
    let transactions = Arc::new(transactions);

    let dialogs = Arc::new(DialogManager::new());

    let (routing, mut routing_events) = RoutingEngine::new(Some(store.clone()), &config.general.namespace);
    routing.start().await?;
    let routing = Arc::new(routing);
    tokio::spawn(async move { while routing_events.recv().await.is_some() {} });

    let (media_relay, mut media_events) = MediaRelayClient::new(&config.media_relay);
    media_relay.spawn_health_loop(std::time::Duration::from_secs(config.media_relay.health_check_interval_secs));
    tokio::spawn(async move { while media_events.recv().await.is_some() {} });

    let sessions = Arc::new(SessionTracker::new(store.clone(), &config.general.namespace, &config.session_tracker));
    let dialog_sync = Arc::new(DialogSync::new(Some(store.clone()), &config.general.namespace));

    let engine = Arc::new(B2buaEngine::new(
        transactions.clone(),
        dialogs.clone(),
        routing.clone(),
        media_relay.clone(),
        sessions.clone(),
        dialog_sync.clone(),
        config.sip.clone(),
        format!("{}:{}", config.sip.listen_host, config.sip.udp_port),
    ));

    let recv_transactions = transactions.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(envelope) = inbound_rx.recv().await {
            if let Err(e) = recv_transactions.on_message(envelope.message, envelope.peer, envelope.transport).await {
                warn!("failed to process inbound message from {}: {e}", envelope.peer);
            }
        }
    });

    let dispatch_engine = engine.clone();
    let dispatch_transactions = transactions.clone();
    let dispatch_task = tokio::spawn(async move {
        while let Some(event) = tx_events.recv().await {
            match event {
                TransactionEvent::RequestReceived { key, request, source, transport } => {
                    dispatch_request(&dispatch_engine, &dispatch_transactions, key, request, source, transport).await;
                }
                TransactionEvent::Timeout { key } => {
                    if let Some(pair) = dispatch_engine.find_pair_by_a_leg_tx(&key) {
                        dispatch_engine.terminate_pair(&pair.id, "Timer B expiry").await;
                    }
                }
                TransactionEvent::TransportError { key, reason } => {
                    warn!("transport error on {:?}: {reason}", key);
                }
                TransactionEvent::ResponseReceived { key, response } => {
                    if let Err(e) = dispatch_engine.handle_b_leg_response(&key, response).await {
                        warn!("failed to bridge B-leg response: {e}");
                    }
                }
            }
        }
    });

    let sweep_engine = engine.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            sweep_engine.sweep_stale_early_pairs().await;
        }
    });

    info!("b2bua-core listening on {}:{} (udp/tcp)", config.sip.listen_host, config.sip.udp_port);

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = recv_task => {}
        _ = dispatch_task => {}
        _ = sweep_task => {}
    }

    info!("b2bua-core shutdown complete");
    Ok(std::process::ExitCode::SUCCESS)
}

async fn dispatch_request(
    engine: &Arc<B2buaEngine>,
    transactions: &Arc<TransactionManager>,
    key: b2bua_core::sip::transaction::TransactionKey,
    request: rsip::Request,
    source: std::net::SocketAddr,
    transport: TransportKind,
) {
    match request.method {
        rsip::Method::Invite => match existing_dialog(engine, &request) {
            Some(dialog) => dispatch_reinvite(engine, transactions, &key, request, dialog).await,
            None => {
                if let Err(e) = engine.handle_a_leg_invite(key, request, source, transport).await {
                    warn!("failed to handle A-leg INVITE: {e}");
                }
            }
        },
        rsip::Method::Bye => {
            match existing_dialog(engine, &request) {
                Some(dialog) if !cseq_in_order(engine, &dialog, &request) => {
                    let _ = transactions.send_response(&key, dummy_response(&request, 500, "Out of Order")).await;
                }
                Some(dialog) => {
                    if let Some(pair) = engine.pair(&dialog.pair_id) {
                        engine.handle_bye(&pair.id, true).await.ok();
                        let _ = transactions.send_response(&key, dummy_200(&request)).await;
                    } else {
                        let _ = transactions.send_response(&key, dummy_response(&request, 481, "Call/Transaction Does Not Exist")).await;
                    }
                }
                None => {
                    let _ = transactions.send_response(&key, dummy_response(&request, 481, "Call/Transaction Does Not Exist")).await;
                }
            }
        }
        rsip::Method::Cancel => {
            if let Some(pair) = engine.find_pair_by_a_leg_tx(&key) {
                engine.handle_cancel(&pair.id).await.ok();
            }
            let _ = transactions.send_response(&key, dummy_200(&request)).await;
        }
        _ => {
            let _ = transactions.send_response(&key, dummy_response(&request, 501, "Not Implemented")).await;
        }
    }
}

/// Finds the dialog an in-dialog request (BYE, re-INVITE) targets. A fresh
/// request carries no To-tag, so this naturally returns `None` for an
/// initial INVITE and routes it to `handle_a_leg_invite` instead.
fn existing_dialog(engine: &Arc<B2buaEngine>, request: &rsip::Request) -> Option<Dialog> {
    let call_id = b2bua_core::sip::call_id(&rsip::SipMessage::Request(request.clone())).ok()?;
    let from_tag = extract_from_tag(request).ok()?;
    let to_tag = extract_to_tag(request).ok()?;
    engine.dialogs.get(&DialogId { call_id, local_tag: to_tag, remote_tag: from_tag })
}

/// §5 ordering guarantee: an out-of-order in-dialog request's CSeq is
/// rejected by the caller rather than forwarded. Advances the dialog's
/// remote CSeq watermark as a side effect when the request is in order.
fn cseq_in_order(engine: &Arc<B2buaEngine>, dialog: &Dialog, request: &rsip::Request) -> bool {
    let Ok(cseq) = extract_cseq_number(request) else { return false };
    if !dialog.accepts_remote_cseq(cseq) {
        return false;
    }
    engine.dialogs.update(&dialog.id, |d| d.observe_remote_cseq(cseq)).ok();
    true
}

async fn dispatch_reinvite(engine: &Arc<B2buaEngine>, transactions: &Arc<TransactionManager>, key: &b2bua_core::sip::transaction::TransactionKey, request: rsip::Request, dialog: Dialog) {
    if !cseq_in_order(engine, &dialog, &request) {
        let _ = transactions.send_response(key, dummy_response(&request, 500, "Out of Order")).await;
        return;
    }
    if let Err(e) = engine.handle_reinvite(key, request, &dialog).await {
        warn!("failed to handle re-INVITE: {e}");
    }
}

fn extract_cseq_number(request: &rsip::Request) -> Result<u32> {
    use rsip::prelude::*;
    let header = request.cseq_header().map_err(|e| b2bua_core::Error::protocol(e.to_string()))?;
    header.typed().map_err(|e| b2bua_core::Error::protocol(e.to_string())).map(|c| c.seq)
}

fn extract_from_tag(request: &rsip::Request) -> Result<String> {
    use rsip::prelude::*;
    let header = request.from_header().map_err(|e| b2bua_core::Error::protocol(e.to_string()))?;
    header.typed().map_err(|e| b2bua_core::Error::protocol(e.to_string()))?.tag().map(|t| t.to_string()).ok_or_else(|| b2bua_core::Error::protocol("missing tag"))
}

fn extract_to_tag(request: &rsip::Request) -> Result<String> {
    use rsip::prelude::*;
    let header = request.to_header().map_err(|e| b2bua_core::Error::protocol(e.to_string()))?;
    header.typed().map_err(|e| b2bua_core::Error::protocol(e.to_string()))?.tag().map(|t| t.to_string()).ok_or_else(|| b2bua_core::Error::protocol("missing tag"))
}

fn dummy_200(request: &rsip::Request) -> rsip::Response {
    dummy_response(request, 200, "OK")
}

fn dummy_response(request: &rsip::Request, status: u16, reason: &str) -> rsip::Response {
    use rsip::prelude::*;
    let headers: Vec<rsip::Header> = vec![
        request.via_header().cloned().map(Into::into).unwrap_or(rsip::headers::Via::from("SIP/2.0/UDP invalid").into()),
        request.from_header().cloned().map(Into::into).unwrap_or(rsip::headers::From::from("sip:invalid@invalid").into()),
        request.to_header().cloned().map(Into::into).unwrap_or(rsip::headers::To::from("sip:invalid@invalid").into()),
        request.call_id_header().cloned().map(Into::into).unwrap_or(rsip::headers::CallId::from("invalid").into()),
        request.cseq_header().cloned().map(Into::into).unwrap_or(rsip::headers::CSeq::from("1 INVITE").into()),
    ];
    rsip::Response { status_code: rsip::StatusCode::Unofficial(status, reason.to_string()), version: rsip::Version::V2, headers: headers.into(), body: Vec::new() }
}
