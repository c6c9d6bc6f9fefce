//! Application entry: request loop over stdin and stdout.

use std::future::Future;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::AppConfig;
use crate::protocol::{Command, Request, Response};
use crate::service::VaultService;
use mqvault_common::{Error, Result};
use mqvault_vault::VaultManager;

/// The application: configuration plus the backends it can open.
pub struct App {
    config: AppConfig,
    manager: VaultManager,
}

impl App {
    /// Create the application.
    ///
    /// # Errors
    /// - Configuration fails validation
    /// - Configured backend is not registered
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let manager = VaultManager::new();
        if !manager.registry().has_store(&config.backend) {
            return Err(Error::InvalidInput(format!(
                "Unknown backend '{}' (available: {})",
                config.backend,
                manager.registry().stores().join(", ")
            )));
        }
        Ok(Self { config, manager })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Open the configured vault.
    pub async fn open_service(&self) -> Result<VaultService> {
        let vault = self
            .manager
            .open_vault(
                &self.config.backend,
                self.config.store_config(),
                self.config.session_policy(),
                self.config.io_timeout(),
            )
            .await?;
        Ok(VaultService::new(vault, self.config.verbose))
    }

    /// Serve requests from stdin until EOF, `shutdown`, or Ctrl-C.
    ///
    /// # Postconditions
    /// - Every request read has been answered
    /// - The vault is locked
    ///
    /// # Errors
    /// - The vault cannot be opened
    /// - Reading stdin or writing stdout fails
    pub async fn run(&self) -> Result<()> {
        let service = self.open_service().await?;
        info!(backend = %self.config.backend, "Serving requests on stdin");
        serve(
            service,
            tokio::io::stdin(),
            tokio::io::stdout(),
            interrupted(),
        )
        .await
    }
}

async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received, shutting down"),
        Err(e) => {
            warn!(error = %e, "Cannot listen for interrupts");
            std::future::pending::<()>().await
        }
    }
}

/// Answer requests read from `input` on `output` until EOF, a `shutdown`
/// request, or `shutdown` resolving.
///
/// Requests run concurrently, except those that change vault state or key
/// material: each of those waits for earlier requests and runs alone.
/// Before returning, in-flight requests finish and the vault is locked.
pub async fn serve<R, W, S>(service: VaultService, input: R, output: W, shutdown: S) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let (tx, rx) = mpsc::unbounded_channel::<Response>();
    let writer = tokio::spawn(write_responses(output, rx));

    let mut lines = BufReader::new(input).lines();
    let mut in_flight = JoinSet::new();
    let mut shutdown_request = None;
    tokio::pin!(shutdown);

    let outcome: Result<()> = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join(joined);
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => Zeroizing::new(line),
                    Ok(None) => {
                        debug!("Input closed");
                        break Ok(());
                    }
                    Err(e) => break Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let request = match Request::parse(&line) {
                    Ok(request) => request,
                    Err((id, e)) => {
                        warn!(error = %e, "Rejected request line");
                        let _ = tx.send(Response::failure(id, &e));
                        continue;
                    }
                };

                if request.command == Command::Shutdown {
                    shutdown_request = Some(request);
                    break Ok(());
                }

                if request.command.is_exclusive() {
                    drain(&mut in_flight).await;
                    let _ = tx.send(service.handle(request).await);
                } else {
                    let service = service.clone();
                    let tx = tx.clone();
                    in_flight.spawn(async move {
                        let _ = tx.send(service.handle(request).await);
                    });
                }
            }
        }
    };

    drain(&mut in_flight).await;
    if let Some(request) = shutdown_request {
        let _ = tx.send(service.handle(request).await);
    }
    let locked = service.lock().await;
    info!("Vault locked, request loop stopped");

    drop(tx);
    let written = writer
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    outcome?;
    locked?;
    written
}

async fn drain(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Request task failed");
    }
}

async fn write_responses<W>(mut output: W, mut responses: UnboundedReceiver<Response>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        let line = response.to_line()?;
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{memory_service, SECRET};
    use mqvault_vault::VaultState;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// Run `serve` over `input` and return the responses keyed by id.
    async fn run_lines(
        service: VaultService,
        input: &str,
    ) -> (Result<()>, Vec<Value>) {
        let (output, mut client) = tokio::io::duplex(1 << 20);
        let result = serve(
            service,
            input.as_bytes(),
            output,
            std::future::pending::<()>(),
        )
        .await;

        let mut text = String::new();
        client.read_to_string(&mut text).await.unwrap();
        let responses = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        (result, responses)
    }

    fn by_id(responses: &[Value]) -> HashMap<String, Value> {
        responses
            .iter()
            .map(|r| (r["id"].to_string(), r.clone()))
            .collect()
    }

    #[test]
    fn test_new_rejects_unknown_backend() {
        let config = AppConfig {
            backend: "tape".to_string(),
            ..AppConfig::default()
        };
        assert!(matches!(App::new(config), Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_serve_scenario() {
        let service = memory_service().await;
        let input = format!(
            concat!(
                r#"{{"id": 1, "op": "initialize", "secret": "{s}"}}"#,
                "\n",
                r#"{{"id": 2, "op": "unlock", "secret": "{s}"}}"#,
                "\n",
                r#"{{"id": 3, "op": "seal", "key": "a", "value": "alpha"}}"#,
                "\n",
                r#"{{"id": 4, "op": "seal", "key": "b", "value": "beta"}}"#,
                "\n",
                r#"{{"id": 5, "op": "lock"}}"#,
                "\n",
                r#"{{"id": 6, "op": "open", "key": "a"}}"#,
                "\n",
                r#"{{"id": 7, "op": "unlock", "secret": "wrong-secret-value"}}"#,
                "\n",
                r#"{{"id": 8, "op": "unlock", "secret": "{s}"}}"#,
                "\n",
                r#"{{"id": 9, "op": "open", "key": "b"}}"#,
                "\n",
            ),
            s = SECRET
        );

        let (result, responses) = run_lines(service.clone(), &input).await;
        result.unwrap();
        assert_eq!(responses.len(), 9);

        let responses = by_id(&responses);
        for id in ["1", "2", "3", "4", "5", "8"] {
            assert_eq!(responses[id]["ok"], true, "request {}", id);
        }
        assert_eq!(responses["6"]["error"]["kind"], "locked");
        assert_eq!(responses["7"]["error"]["kind"], "authentication");
        assert_eq!(responses["9"]["result"]["value"], "beta");

        // EOF forces a lock.
        assert_eq!(service.status().await.state, VaultState::Locked);
    }

    #[tokio::test]
    async fn test_malformed_lines() {
        let service = memory_service().await;
        let input = "this is not json\n\n{\"id\": 2, \"op\": \"frobnicate\"}\n";

        let (result, responses) = run_lines(service, input).await;
        result.unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["kind"], "invalid_input");
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(responses[1]["error"]["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_shutdown_request_stops_and_locks() {
        let service = memory_service().await;
        service.initialize(SECRET.into()).await.unwrap();
        service.unlock(SECRET.into()).await.unwrap();

        let input = concat!(
            r#"{"id": 1, "op": "seal", "key": "k", "value": "v"}"#,
            "\n",
            r#"{"id": 2, "op": "shutdown"}"#,
            "\n",
            r#"{"id": 3, "op": "status"}"#,
            "\n",
        );

        let (result, responses) = run_lines(service.clone(), input).await;
        result.unwrap();

        let responses = by_id(&responses);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses["1"]["ok"], true);
        assert_eq!(responses["2"]["result"]["state"], "locked");
        assert!(!responses.contains_key("3"));
        assert_eq!(service.status().await.state, VaultState::Locked);
    }

    #[tokio::test]
    async fn test_interrupt_locks() {
        let service = memory_service().await;
        service.initialize(SECRET.into()).await.unwrap();
        service.unlock(SECRET.into()).await.unwrap();

        // Input that never closes.
        let (input, _keep_open) = tokio::io::duplex(64);
        let (output, _client) = tokio::io::duplex(1 << 16);

        serve(
            service.clone(),
            input,
            output,
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        assert_eq!(service.status().await.state, VaultState::Locked);
    }

    #[tokio::test]
    async fn test_in_flight_requests_finish_before_lock() {
        let service = memory_service().await;
        service.initialize(SECRET.into()).await.unwrap();
        service.unlock(SECRET.into()).await.unwrap();

        let input: String = (0..20)
            .map(|i| format!(r#"{{"id": {}, "op": "seal", "key": "k{}", "value": "v"}}"#, i, i) + "\n")
            .collect();

        let (result, responses) = run_lines(service.clone(), &input).await;
        result.unwrap();
        assert_eq!(responses.len(), 20);
        assert!(responses.iter().all(|r| r["ok"] == true));

        service.unlock(SECRET.into()).await.unwrap();
        assert_eq!(service.list(None).await.unwrap().len(), 20);
    }
}
