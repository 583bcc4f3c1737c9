use std::net::SocketAddr;

use anyhow::Result;
use http::StatusCode;
use serde_json::{Map, Value};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::{EventAction, EventRecord};
use crate::logging::AccessLogBuilder;
use crate::pipeline::{Verdict, DEADLINE_EXCEEDED};
use crate::request::WafRequest;

use super::codec::{read_request_head, RequestHead};
use super::origin;
use super::respond::{respond_with_access_log, send_response, shutdown_stream};
use super::AppContext;

/// Request header carrying the edge's opaque metadata bag as JSON. Stripped
/// before any byte reaches an origin.
pub const EDGE_META_HEADER: &str = "x-edge-meta";

pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let settings = app.settings.clone();

    let head = match read_request_head(
        &mut reader,
        peer,
        settings.client_timeout(),
        settings.client_timeout(),
        settings.max_header_size,
    )
    .await
    {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(err) => {
            debug!(peer = %peer, error = %err, "malformed request head");
            let _ = send_response(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                "text/plain; charset=utf-8",
                b"malformed request\n",
                settings.client_timeout(),
            )
            .await;
            let _ = shutdown_stream(reader.get_mut(), settings.client_timeout()).await;
            return Ok(());
        }
    };

    let start = Instant::now();
    let deadline = start + settings.request_timeout();

    let Some(request) = build_waf_request(head, peer) else {
        respond_with_access_log(
            reader.get_mut(),
            StatusCode::BAD_REQUEST,
            "text/plain; charset=utf-8",
            b"missing Host header\n",
            settings.client_timeout(),
            start.elapsed(),
            AccessLogBuilder::new(peer).decision("ERROR"),
        )
        .await?;
        return Ok(());
    };

    let verdict = app.pipeline.decide(&request, deadline).await;
    match verdict {
        Verdict::Block(outcome) => {
            let mut log = request
                .access_log_builder(peer)
                .decision(outcome.action.as_str());
            if let Some(rule_id) = &outcome.rule_id {
                log = log.rule(rule_id.clone());
            }
            respond_with_access_log(
                reader.get_mut(),
                outcome.response.status,
                &outcome.response.content_type,
                outcome.response.body.as_bytes(),
                settings.client_timeout(),
                start.elapsed(),
                log,
            )
            .await
        }
        Verdict::Dispatch(outcome) => {
            let route = outcome.route;
            // A dispatch decision does not start an origin call once the
            // request deadline has already passed.
            if Instant::now() >= deadline {
                app.pipeline.logger().emit(EventRecord::for_request(
                    &request,
                    EventAction::Block,
                    Some(DEADLINE_EXCEEDED.to_string()),
                    route.id.clone(),
                    Some(route.incoming_host.clone()),
                ));
                return respond_with_access_log(
                    reader.get_mut(),
                    StatusCode::SERVICE_UNAVAILABLE,
                    "text/plain; charset=utf-8",
                    b"request deadline exceeded\n",
                    settings.client_timeout(),
                    start.elapsed(),
                    request
                        .access_log_builder(peer)
                        .decision("BLOCK")
                        .rule(DEADLINE_EXCEEDED)
                        .context(route.id.clone()),
                )
                .await;
            }
            match origin::resolve_target(&route, &settings) {
                Err(misconfig) => {
                    warn!(route = %route.id, error = %misconfig, "origin misconfigured");
                    crate::metrics::record_upstream_error("misconfig");
                    app.pipeline.logger().emit(EventRecord::for_request(
                        &request,
                        EventAction::OriginMisconfig,
                        Some(outcome.rule_id.clone()),
                        route.id.clone(),
                        Some(route.incoming_host.clone()),
                    ));
                    respond_with_access_log(
                        reader.get_mut(),
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain; charset=utf-8",
                        origin::misconfig_body(&misconfig.0).as_bytes(),
                        settings.client_timeout(),
                        start.elapsed(),
                        request
                            .access_log_builder(peer)
                            .decision("ORIGIN_MISCONFIG")
                            .rule(outcome.rule_id.clone())
                            .context(route.id.clone()),
                    )
                    .await
                }
                Ok(target) => {
                    let mut record = EventRecord::for_request(
                        &request,
                        EventAction::OriginDispatch,
                        Some(outcome.rule_id.clone()),
                        route.id.clone(),
                        Some(route.incoming_host.clone()),
                    );
                    if outcome.log_rule {
                        record = record.with_log_rule();
                    }
                    app.pipeline.logger().emit(record);

                    let decision = if outcome.log_rule { "LOG" } else { "ALLOW" };
                    match origin::dispatch(
                        &mut reader,
                        &request,
                        &route,
                        &target,
                        peer,
                        &settings,
                    )
                    .await
                    {
                        Ok(stats) => {
                            shutdown_stream(reader.get_mut(), settings.client_timeout()).await?;
                            request
                                .access_log_builder(peer)
                                .decision(decision)
                                .rule(outcome.rule_id)
                                .context(route.id)
                                .status_u16(stats.status)
                                .bytes_out(stats.bytes_to_client)
                                .elapsed(start.elapsed())
                                .log();
                            Ok(())
                        }
                        Err(err) => {
                            warn!(route = %route.id, error = %err, "origin dispatch failed");
                            crate::metrics::record_upstream_error("io");
                            // Best effort: if part of a response already went
                            // out this write fails and the close suffices.
                            respond_with_access_log(
                                reader.get_mut(),
                                StatusCode::BAD_GATEWAY,
                                "text/plain; charset=utf-8",
                                origin::upstream_error_body().as_bytes(),
                                settings.client_timeout(),
                                start.elapsed(),
                                request
                                    .access_log_builder(peer)
                                    .decision("ERROR")
                                    .rule(outcome.rule_id)
                                    .context(route.id),
                            )
                            .await
                        }
                    }
                }
            }
        }
    }
}

impl WafRequest {
    fn access_log_builder(&self, peer: SocketAddr) -> AccessLogBuilder {
        AccessLogBuilder::new(peer)
            .method(self.method.as_str())
            .host(self.host.clone())
            .path(self.path().to_string())
    }
}

/// Assembles the engine-facing request value. `None` when the request has no
/// Host header, which the data plane answers with a 400.
fn build_waf_request(head: RequestHead, peer: SocketAddr) -> Option<WafRequest> {
    let RequestHead {
        method,
        target,
        headers,
    } = head;
    let host = headers.host()?.to_string();
    let content_length = headers.content_length();
    let chunked = headers.is_chunked();
    let headers = headers.into_headers();

    let meta = headers
        .iter()
        .find(|(name, _)| name == EDGE_META_HEADER)
        .and_then(|(_, value)| parse_edge_meta(value))
        .unwrap_or_default();

    Some(WafRequest {
        method,
        target,
        host,
        headers,
        meta,
        peer: peer.ip(),
        content_length,
        chunked,
    })
}

fn parse_edge_meta(raw: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            warn!("edge metadata header was valid JSON but not an object; ignoring");
            None
        }
        Err(err) => {
            warn!(error = %err, "unparseable edge metadata header; ignoring");
            None
        }
    }
}
