//! Worker-side command loop.
//!
//! The child half of the bridge: reads one request frame at a time off the
//! transport, runs it through the harness on the blocking pool, and writes
//! exactly one response frame back. Strictly sequential by protocol; the
//! loop never reads ahead while a tool is running.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{FramingError, RpcCodec};
use crate::bridge::protocol::{Method, Request, RequestId, Response};
use crate::harness::{self, RunOutput, ToolRegistry};

/// Serves requests until an `exit` request, end of stream, or a transport
/// fault. Generic over the byte streams so tests can drive it over
/// in-memory pipes; [`serve_stdio`] binds it to the real transport.
pub async fn run_loop<R, W>(registry: Arc<ToolRegistry>, reader: R, writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Requests are decoded in two steps (frame to Value, Value to Request)
    // so a malformed body is reported over the channel instead of being
    // indistinguishable from frame corruption.
    let mut reader = FramedRead::new(reader, RpcCodec::<serde_json::Value>::new());
    let mut writer = FramedWrite::new(writer, RpcCodec::<Response>::new());

    loop {
        let raw = match reader.next().await {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Request stream corrupted, exiting");
                break;
            }
            None => {
                tracing::info!("Request stream closed (dispatcher gone), exiting");
                break;
            }
        };

        let request: Request = match serde_json::from_value(raw.clone()) {
            Ok(request) => request,
            Err(e) => {
                let id = raw
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(RequestId::from)
                    .unwrap_or_else(|| "".into());
                tracing::warn!(%id, error = %e, "Undecodable request");
                let reply = Response::error(id, format!("invalid request: {e}"), true);
                if send_response(&mut writer, reply).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let response = match request.method {
            Method::Exit => {
                tracing::info!(id = %request.id, "Exit requested");
                break;
            }
            Method::Run => run_request(&registry, request).await,
            Method::Unknown => {
                tracing::warn!(id = %request.id, "Unknown method");
                Response::error(request.id, "unknown method", true)
            }
        };

        if send_response(&mut writer, response).await.is_err() {
            break;
        }
    }
}

/// Runs the command loop over the process's own stdio, the transport a
/// supervisor wires a spawned worker to.
pub async fn serve_stdio(registry: Arc<ToolRegistry>) {
    tracing::info!(pid = std::process::id(), "Worker serving on stdio");
    run_loop(registry, stdin(), stdout()).await;
    tracing::info!("Worker loop finished");
}

async fn send_response<W>(
    writer: &mut FramedWrite<W, RpcCodec<Response>>,
    response: Response,
) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = writer.send(response).await {
        tracing::error!(error = %e, "Response write failed");
        return Err(e);
    }
    Ok(())
}

async fn run_request(registry: &Arc<ToolRegistry>, request: Request) -> Response {
    let Request {
        id,
        module,
        argv,
        use_stdin,
        cwd,
        source,
        ..
    } = request;

    let Some(module) = module else {
        return Response::error(id, "run request without module", true);
    };

    tracing::debug!(%id, module = %module, argc = argv.len(), "Running tool");

    let registry = Arc::clone(registry);
    let run = tokio::task::spawn_blocking(move || {
        let cwd = match cwd {
            Some(path) => path,
            // Absent cwd means stay where the worker already is.
            None => std::env::current_dir().map_err(harness::RunError::Io)?,
        };
        harness::run_module(&registry, &module, argv, use_stdin, &cwd, source.as_deref())
    });

    match run.await {
        Ok(Ok(output)) => build_response(id, output),
        Ok(Err(e)) => Response::error(id, e.to_string(), true),
        Err(join_error) => {
            // The harness catches tool panics itself; getting here means the
            // blocking task was torn down out from under us.
            tracing::error!(error = %join_error, "Tool task failed");
            Response::error(id, format!("tool task failed: {join_error}"), true)
        }
    }
}

/// Faults beat stderr, stderr beats stdout, silence is a bare reply.
fn build_response(id: RequestId, output: RunOutput) -> Response {
    if let Some(fault) = output.fault {
        return Response::error(id, fault.to_string(), true);
    }
    if !output.stderr.is_empty() {
        return Response::error(id, output.stderr, false);
    }
    if !output.stdout.is_empty() {
        return Response::result(id, output.stdout);
    }
    Response::empty(id)
}
