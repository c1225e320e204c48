pub mod append;
pub mod backend;
pub mod cache;
pub mod client_cache;
pub mod command;
pub mod fetch;
pub mod handler;
pub mod mailbox;
pub mod messages;
pub mod response;
pub mod state;
pub mod uidplus;
pub mod updates;
pub mod user;

use std::sync::Arc;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;

use crate::runtime::Runtime;
use crate::utils::panic;
use handler::ImapHandler;
use state::ImapSession;

use tokio::net::{ TcpListener, TcpStream };
use tokio::sync::Mutex;
use tokio_rustls::rustls::{ self, pki_types::{ CertificateDer, PrivateKeyDer } };
use tokio_rustls::TlsAcceptor;

use anyhow::Result;
use tracing::{ error, info };

pub async fn run_imap(runtime: Arc<Runtime>) -> anyhow::Result<()> {
    let config = &runtime.config;
    let bind_addr = config.get_value("imap", "bind").unwrap_or("0.0.0.0").to_string();
    let port = config.get_value("imap", "port").unwrap_or("1143").to_string();
    let ssl_port = config.get_value("imap", "ssl_port").unwrap_or("1993").to_string();
    let enable_ssl = config.get_bool("imap", "enable_ssl", false);
    let max_connections = config.get_usize("imap", "max_connections", 1000);

    info!(port = %port, ssl_port = %ssl_port, enable_ssl, "Starting IMAP server");

    let semaphore = Arc::new(tokio::sync::Semaphore::new(max_connections));

    let tls_acceptor = if enable_ssl {
        let cert_path = config
            .get_value("imap", "tls_cert")
            .ok_or_else(|| anyhow::anyhow!("TLS cert missing"))?;
        let key_path = config
            .get_value("imap", "tls_key")
            .ok_or_else(|| anyhow::anyhow!("TLS key missing"))?;

        match create_tls_acceptor(cert_path, key_path) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!(error = %e, "Failed to load TLS certificates");
                return Err(e);
            }
        }
    } else {
        None
    };

    let tls_only = config.get_bool("imap", "tls_only", false);
    let mut listeners = Vec::new();

    if !tls_only {
        let plain_addr = format!("{}:{}", bind_addr, port);
        let plain_listener = match TcpListener::bind(&plain_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(address = %plain_addr, error = %e, "Could not bind IMAP port");
                return Err(e.into());
            }
        };
        info!(address = %plain_addr, "IMAP listening");

        let runtime_plain = runtime.clone();
        let semaphore_plain = semaphore.clone();
        listeners.push(tokio::spawn(async move {
            accept_connections(plain_listener, runtime_plain, semaphore_plain, None).await;
        }));
    } else {
        info!("TLS-only mode, plain IMAP listener disabled");
        if tls_acceptor.is_none() {
            error!("TLS-only requires 'enable_ssl=true' and valid cert/key");
            return Err(anyhow::anyhow!("TLS-only enabled without SSL configuration"));
        }
    }

    if let Some(acceptor) = tls_acceptor {
        let ssl_addr = format!("{}:{}", bind_addr, ssl_port);
        let ssl_listener = TcpListener::bind(&ssl_addr).await?;
        info!(address = %ssl_addr, "IMAPS listening");

        let runtime_ssl = runtime.clone();
        let semaphore_ssl = semaphore.clone();
        listeners.push(tokio::spawn(async move {
            accept_connections(ssl_listener, runtime_ssl, semaphore_ssl, Some(acceptor)).await;
        }));
    } else if tls_only {
        error!("TLS-only mode enabled but IMAPS listener not started");
        return Err(anyhow::anyhow!("IMAPS not available in TLS-only mode"));
    }

    for listener in listeners {
        listener.await?;
    }
    Ok(())
}

/**
 * --------------------------------------------------------------
 * ---------------- IMAP Connection Listener. -------------------
 * --------------------------------------------------------------
 */
async fn accept_connections(
    listener: TcpListener,
    runtime: Arc<Runtime>,
    semaphore: Arc<tokio::sync::Semaphore>,
    tls_acceptor: Option<TlsAcceptor>
) {
    loop {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("Connection semaphore closed");
                break;
            }
        };

        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!(peer = %peer_addr, "New IMAP connection");

                let runtime_clone = runtime.clone();
                let acceptor_clone = tls_acceptor.clone();

                panic::spawn("IMAP connection", async move {
                    let _permit = permit;
                    handle_imap_connection(stream, runtime_clone, acceptor_clone, peer_addr).await;
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/**
 * --------------------------------------------------------------
 * ----------------- Handle IMAP Connection. --------------------
 * --------------------------------------------------------------
 */
async fn handle_imap_connection(
    stream: TcpStream,
    runtime: Arc<Runtime>,
    tls_acceptor: Option<TlsAcceptor>,
    peer_addr: SocketAddr
) {
    let client_id = peer_addr.to_string();
    let session = Arc::new(Mutex::new(ImapSession::new(client_id.clone())));
    let handler = ImapHandler::new(runtime.clone(), session.clone());

    if let Some(acceptor) = tls_acceptor {
        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                session.lock().await.tls_active = true;
                if let Err(e) = handler.handle_connection(tls_stream).await {
                    error!(client = %client_id, error = %e, "IMAPS connection error");
                }
            }
            Err(e) => {
                error!(client = %client_id, error = %e, "TLS handshake failed");
            }
        }
    } else if let Err(e) = handler.handle_connection(stream).await {
        error!(client = %client_id, error = %e, "IMAP connection error");
    }

    info!(client = %client_id, "IMAP connection closed");
}

/**
 * -------------------------------------------------------------
 * ---------------------- Helper Functions. --------------------
 * -------------------------------------------------------------
 */

fn create_tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig
        ::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(path)?;
    let mut reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(anyhow::anyhow!("No certificate found in {}", path));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let key_file = File::open(path)?;
    let mut reader = BufReader::new(key_file);

    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs1(key.into()));
            }
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs8(key.into()));
            }
            Some(rustls_pemfile::Item::Sec1Key(key)) => {
                return Ok(PrivateKeyDer::Sec1(key.into()));
            }
            None => {
                break;
            }
            _ => {
                continue;
            }
        }
    }

    Err(anyhow::anyhow!("No valid private key found in {}", path))
}
