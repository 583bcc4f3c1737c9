use std::sync::Arc;

use http::StatusCode;
use tokio::time::Instant;
use tracing::warn;

use crate::engine::{evaluate_rules, project, Action, Outcome};
use crate::events::{DecisionLogger, EventAction, EventRecord};
use crate::request::WafRequest;
use crate::router::match_route;
use crate::store::{BlockResponse, Route, StoreRegistry};

/// Synthetic rule id reported when the route tier had no matching ALLOW.
pub const DEFAULT_ROUTE_BLOCK: &str = "default-route-block";
/// Synthetic rule id for a request whose deadline expired mid-pipeline.
pub const DEADLINE_EXCEEDED: &str = "deadline-exceeded";
/// Synthetic rule id for a persistence failure surfaced on the hot path.
pub const STORE_FAILURE: &str = "store-failure";

/// Terminal verdict handed to the data plane.
#[derive(Debug)]
pub enum Verdict {
    Block(BlockOutcome),
    Dispatch(DispatchOutcome),
}

#[derive(Debug)]
pub struct BlockOutcome {
    pub response: BlockResponse,
    pub action: EventAction,
    pub rule_id: Option<String>,
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub route: Route,
    pub rule_id: String,
    /// The admitting rule's action was LOG; dispatch proceeds but the event
    /// record keeps the distinction.
    pub log_rule: bool,
}

/// Drives one request through global evaluation, host routing, and route
/// evaluation, producing exactly one terminal verdict. Block-tier terminals
/// emit their decision event here; dispatch terminals emit from the origin
/// dispatcher once the outcome (dispatch vs misconfig) is known.
pub struct Pipeline {
    registry: Arc<StoreRegistry>,
    logger: DecisionLogger,
}

impl Pipeline {
    pub fn new(registry: Arc<StoreRegistry>, logger: DecisionLogger) -> Self {
        Self { registry, logger }
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    pub fn logger(&self) -> &DecisionLogger {
        &self.logger
    }

    pub async fn decide(&self, request: &WafRequest, deadline: Instant) -> Verdict {
        if Instant::now() >= deadline {
            return self.deadline_block(request, "global");
        }

        let global = self.registry.global();
        let global_snapshot = match global.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "global store unavailable");
                return self.store_failure_block(request, "global");
            }
        };

        let fields = project(request);
        let global_outcome = evaluate_rules(&global_snapshot.rules, &fields);

        let mut log_rule = false;
        match global_outcome {
            Outcome::NoMatch => {
                // No global admission: the request is not ours to route.
                let response = global_snapshot.block_response(None);
                return self.block(request, "global", None, EventAction::FinalDeny, response, false);
            }
            Outcome::Match {
                action,
                rule_id,
                block_http_code,
            } => {
                crate::metrics::record_rule_hit("global", &rule_id);
                match action {
                    Action::Block | Action::Challenge => {
                        let response = global_snapshot.block_response(block_http_code);
                        let event_action = if action == Action::Challenge {
                            EventAction::Challenge
                        } else {
                            EventAction::Block
                        };
                        return self.block(
                            request,
                            "global",
                            Some(rule_id),
                            event_action,
                            response,
                            false,
                        );
                    }
                    Action::Log => log_rule = true,
                    Action::Allow => {}
                }
            }
        }

        let Some(route) = match_route(&global_snapshot.routes, &request.host) else {
            let response = global_snapshot.block_response(None);
            return self.block(request, "global", None, EventAction::FinalDeny, response, log_rule);
        };
        let route = route.clone();

        if Instant::now() >= deadline {
            return self.deadline_block(request, &route.id);
        }

        let route_store = match self.registry.route_store(&route.id) {
            Ok(store) => store,
            Err(err) => {
                warn!(route = %route.id, error = %err, "route store unavailable");
                return self.store_failure_block(request, &route.id);
            }
        };
        let route_snapshot = match route_store.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(route = %route.id, error = %err, "route snapshot load failed");
                return self.store_failure_block(request, &route.id);
            }
        };

        match evaluate_rules(&route_snapshot.rules, &fields) {
            Outcome::Match {
                action,
                rule_id,
                block_http_code,
            } => {
                crate::metrics::record_rule_hit(&route.id, &rule_id);
                match action {
                    Action::Allow | Action::Log => Verdict::Dispatch(DispatchOutcome {
                        route,
                        rule_id,
                        log_rule: log_rule || action == Action::Log,
                    }),
                    Action::Block | Action::Challenge => {
                        // Block bodies always resolve against the global
                        // store's error pages.
                        let response = global_snapshot.block_response(block_http_code);
                        let event_action = if action == Action::Challenge {
                            EventAction::Challenge
                        } else {
                            EventAction::Block
                        };
                        self.block_on_route(
                            request,
                            &route,
                            Some(rule_id),
                            event_action,
                            response,
                            log_rule,
                        )
                    }
                }
            }
            Outcome::NoMatch => {
                // Default-block: admission requires an explicit ALLOW.
                let response = global_snapshot.block_response(None);
                self.block_on_route(
                    request,
                    &route,
                    Some(DEFAULT_ROUTE_BLOCK.to_string()),
                    EventAction::Block,
                    response,
                    log_rule,
                )
            }
        }
    }

    fn deadline_block(&self, request: &WafRequest, context: &str) -> Verdict {
        let response = BlockResponse {
            status: StatusCode::SERVICE_UNAVAILABLE,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: "request deadline exceeded\n".to_string(),
        };
        self.block(
            request,
            context,
            Some(DEADLINE_EXCEEDED.to_string()),
            EventAction::Block,
            response,
            false,
        )
    }

    fn store_failure_block(&self, request: &WafRequest, context: &str) -> Verdict {
        let response = BlockResponse {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: "configuration store unavailable\n".to_string(),
        };
        self.block(
            request,
            context,
            Some(STORE_FAILURE.to_string()),
            EventAction::Block,
            response,
            false,
        )
    }

    fn block(
        &self,
        request: &WafRequest,
        context: &str,
        rule_id: Option<String>,
        action: EventAction,
        response: BlockResponse,
        log_rule: bool,
    ) -> Verdict {
        let mut record = EventRecord::for_request(
            request,
            action,
            rule_id.clone(),
            context.to_string(),
            None,
        );
        if log_rule {
            record = record.with_log_rule();
        }
        self.logger.emit(record);
        Verdict::Block(BlockOutcome {
            response,
            action,
            rule_id,
        })
    }

    fn block_on_route(
        &self,
        request: &WafRequest,
        route: &Route,
        rule_id: Option<String>,
        action: EventAction,
        response: BlockResponse,
        log_rule: bool,
    ) -> Verdict {
        let mut record = EventRecord::for_request(
            request,
            action,
            rule_id.clone(),
            route.id.clone(),
            Some(route.incoming_host.clone()),
        );
        if log_rule {
            record = record.with_log_rule();
        }
        self.logger.emit(record);
        Verdict::Block(BlockOutcome {
            response,
            action,
            rule_id,
        })
    }
}
