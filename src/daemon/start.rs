//! Starting the daemon.

use std::path::Path;
use std::sync::Arc;
use log::{error, info, warn};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::select;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use crate::commons::error::Error;
use crate::commons::file;
use crate::constants::{ARCHIVE_DIR, SIGNSERVER_SERVER_APP, SIGNSERVER_VERSION};
use crate::server::archive::Archiver;
use crate::server::keyusage::KeyUsageCounter;
use crate::server::{Services, WorkerProcessCore, WorkerRegistry};
use super::config::{Config, CounterStorage};
use super::http::request::ConnectionInfo;
use super::http::server::HttpServer;
use super::http::tls::{self, MaybeTlsTcpStream};


/// Runs the daemon until it fails or is interrupted.
///
/// If given, `signal_running` is triggered once the listener is bound.
pub async fn start_signserver_daemon(
    config: Arc<Config>,
    signal_running: Option<oneshot::Sender<()>>,
) -> Result<(), Error> {
    info!("Starting {SIGNSERVER_SERVER_APP} {SIGNSERVER_VERSION}");
    test_data_dir_or_die(&config.data_dir);

    let core = build_core(&config)?;
    let server = HttpServer::new(core, config.post_limit);

    let tls = match config.https.as_ref() {
        Some(https) => {
            let tls_config = tls::create_server_config(
                &https.key_file,
                &https.cert_file,
                https.client_ca_file.as_deref(),
            ).map_err(|err| Error::signserver(err.to_string()))?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        None => None,
    };

    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr).await.map_err(|err| {
        Error::signserver(format!("Could not bind to {addr}: {err}"))
    })?;
    info!(
        "Listening on {}://{addr}",
        if tls.is_some() { "https" } else { "http" }
    );

    if let Some(tx) = signal_running {
        let _ = tx.send(());
    }

    select!(
        _ = serve(listener, server, tls) => {
            error!("http server stopped unexpectedly")
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down")
        }
    );
    Ok(())
}

/// Creates the shared services and all configured workers.
///
/// Workers with fatal errors are still added so that they show up in the
/// health check and can be fixed by changing their configuration.
pub fn build_core(config: &Config) -> Result<WorkerProcessCore, Error> {
    let key_usage = match config.key_usage_counter {
        CounterStorage::Memory => KeyUsageCounter::memory(),
        CounterStorage::Disk => {
            KeyUsageCounter::disk(&config.key_usage_dir()).map_err(|err| {
                Error::signserver(format!(
                    "Cannot set up key usage counter: {err}"
                ))
            })?
        }
    };
    let archiver = match config.archive_dir.as_ref() {
        Some(dir) => Archiver::disk(dir),
        None => Archiver::disk(&config.data_dir.join(ARCHIVE_DIR)),
    }.map_err(|err| {
        Error::signserver(format!("Cannot set up archive: {err}"))
    })?;

    let registry = WorkerRegistry::new(config.pkcs11_libraries.clone());
    for worker in &config.workers {
        let state = registry.add_worker(
            worker.id,
            &worker.name,
            worker.worker_type,
            worker.properties.clone(),
        )?;
        for err in state.fatal_errors() {
            warn!("Worker {} ({}): {err}", worker.id, worker.name);
        }
    }

    Ok(WorkerProcessCore::new(
        Arc::new(registry), Arc::new(Services::new(key_usage, archiver))
    ))
}

/// Serves HTTP on a listener until accepting fails.
pub async fn serve(
    listener: TcpListener,
    server: HttpServer,
    tls: Option<TlsAcceptor>,
) {
    let server = Arc::new(server);
    loop {
        let (sock, remote_addr) = match listener.accept().await {
            Ok(res) => res,
            Err(err) => {
                error!("Fatal error in HTTP server: {err}");
                return;
            }
        };
        let server = server.clone();
        let tls = tls.clone();
        tokio::task::spawn(async move {
            let stream = match MaybeTlsTcpStream::accept(
                sock, tls.as_ref()
            ).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("TLS handshake with {remote_addr} failed: {err}");
                    return;
                }
            };
            let connection = ConnectionInfo {
                remote_addr: Some(remote_addr),
                client_certificate: stream.client_certificate(),
            };
            let _ = hyper_util::server::conn::auto::Builder::new(
                TokioExecutor::new(),
            )
            .serve_connection(
                TokioIo::new(stream),
                service_fn(move |req| {
                    let server = server.clone();
                    let connection = connection.clone();
                    async move {
                        server.process_request(req, connection).await
                    }
                }),
            )
            .await;
        });
    }
}

fn test_data_dir_or_die(dir: &Path) {
    let test_file = dir.join("test");

    if let Err(e) = file::save(b"test", &test_file) {
        print_write_error_hint_and_die(format!(
            "Cannot write to data dir '{}', Error: {}",
            dir.to_string_lossy(),
            e
        ));
    }
    else if let Err(e) = file::delete_file(&test_file) {
        print_write_error_hint_and_die(format!(
            "Cannot delete test file '{}' in data dir, Error: {}",
            test_file.to_string_lossy(),
            e
        ));
    }
}

fn print_write_error_hint_and_die(error_msg: String) {
    eprintln!("{error_msg}");
    eprintln!();
    eprintln!("Hint: if you use systemd you may need to override the allowed");
    eprintln!("ReadWritePaths, the easiest way may be by doing ");
    eprintln!("'systemctl edit signserverd' and add a section like:");
    eprintln!();
    eprintln!("[Service]");
    eprintln!("ReadWritePaths=/local/path1 /local/path2 ...");
    std::process::exit(1);
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::worker::WorkerIdentifier;
    use crate::test;

    #[test]
    fn build_core_adds_all_workers() {
        let dir = test::tmp_dir();
        let config = Config::from_toml(&format!(
            r#"
                data_dir = "{}"
                key_usage_counter = "disk"

                [[workers]]
                id = 1
                name = "Broken"
                type = "cms"

                [[workers]]
                id = 2
                name = "Dispatcher"
                type = "dispatcher"
                properties = {{ MAPPINGS = "1.2.3:Broken" }}
            "#,
            dir.path().display()
        )).unwrap();

        let core = build_core(&config).unwrap();
        assert_eq!(core.registry().worker_ids(), vec![1, 2]);
        let broken = core.registry().get(&WorkerIdentifier::Id(1)).unwrap();
        assert!(!broken.fatal_errors().is_empty());
        let dispatcher = core.registry().get(&"dispatcher".into()).unwrap();
        assert!(dispatcher.fatal_errors().is_empty());
        assert!(dir.path().join("keyusage").is_dir());
        assert!(dir.path().join("archive").is_dir());
    }
}
