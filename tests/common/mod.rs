use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use switchboard::framing::{pipe, Framing};
use switchboard::handler::{handler_fn, MethodMap};
use switchboard::{Client, ClientOptions, RpcError, Server, ServerOptions};

/// The arithmetic method set shared by the session and batch tests.
///
/// - `Math.Add` sums its integer params.
/// - `Math.Sub` subtracts exactly two integers.
/// - `Log` accepts anything and returns null.
/// - `Delay.Echo` takes `[millis, value]`, sleeps, then returns `value`.
#[allow(dead_code)]
pub fn math_methods() -> MethodMap {
    MethodMap::new()
        .with(
            "Math.Add",
            handler_fn(|_ctx, req| async move {
                let args: Vec<i64> = serde_json::from_value(req.params.unwrap_or(json!([])))
                    .map_err(|_| RpcError::InvalidParams("want an array of integers".to_string()))?;
                Ok(json!(args.iter().sum::<i64>()))
            }),
        )
        .with(
            "Math.Sub",
            handler_fn(|_ctx, req| async move {
                let args: Vec<i64> = serde_json::from_value(req.params.unwrap_or(json!([])))
                    .map_err(|_| RpcError::InvalidParams("want an array of integers".to_string()))?;
                if args.len() != 2 {
                    return Err(
                        RpcError::InvalidParams("want exactly two integers".to_string()).into(),
                    );
                }
                Ok(json!(args[0] - args[1]))
            }),
        )
        .with("Log", handler_fn(|_ctx, _req| async { Ok(Value::Null) }))
        .with(
            "Delay.Echo",
            handler_fn(|_ctx, req| async move {
                let args = req.params.unwrap_or(json!([]));
                let millis = args[0].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(args[1].clone())
            }),
        )
}

/// Install a test subscriber so `RUST_LOG` surfaces runtime traces.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a client/server session over an in-memory pipe speaking `framing`.
#[allow(dead_code)]
pub fn start_session(framing: &Framing, options: ServerOptions) -> (Server, Client) {
    init_tracing();
    let (server_end, client_end) = pipe::pipe(framing);
    let server = Server::new(Arc::new(math_methods()), options);
    server.start(server_end);
    let client = Client::new(client_end, ClientOptions::default());
    (server, client)
}

/// Tear a session down and assert it terminated cleanly.
#[allow(dead_code)]
pub async fn shutdown(server: Server, client: Client) {
    client.close().await;
    server.stop();
    tokio::time::timeout(Duration::from_secs(5), server.wait())
        .await
        .expect("server did not terminate")
        .expect("server terminated with an error");
}
