//! Ordered request handling: preflight, forwarder, static bundle
//!
//! Stages run in order until one answers. The CORS policy is applied to
//! whichever response comes out, including error responses.

use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use tracing::debug;

use crate::config::Config;
use crate::cors::CorsPolicy;
use crate::error::ResponseBody;
use crate::forward::Forwarder;
use crate::static_files::StaticFiles;

/// One request handler in the chain
pub enum Stage {
    /// Answers OPTIONS requests with the CORS policy
    Preflight,
    /// Relays requests under the API prefix
    Forward(Forwarder),
    /// Serves files and the SPA fallback; always answers
    Static(StaticFiles),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::Forward(_) => "forward",
            Stage::Static(_) => "static",
        }
    }
}

/// Result of offering a request to a stage
enum Outcome {
    Respond(Response<ResponseBody>),
    Pass(Request<Incoming>),
}

pub struct Pipeline {
    cors: CorsPolicy,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(cors: CorsPolicy, stages: Vec<Stage>) -> Self {
        Self { cors, stages }
    }

    /// The standard chain: preflight, then forwarder, then static files
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let cors = CorsPolicy::from_config(&config.cors)?;
        let stages = vec![
            Stage::Preflight,
            Stage::Forward(Forwarder::from_config(&config.proxy)?),
            Stage::Static(StaticFiles::from_config(&config.static_files)),
        ];
        Ok(Self::new(cors, stages))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn forwarder(&self) -> Option<&Forwarder> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::Forward(forwarder) => Some(forwarder),
            _ => None,
        })
    }

    pub fn static_files(&self) -> Option<&StaticFiles> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::Static(files) => Some(files),
            _ => None,
        })
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<ResponseBody> {
        debug!(method = %req.method(), uri = %req.uri(), client = %client_addr, "Incoming request");

        let mut response = self.dispatch(req, client_addr).await;
        self.cors.apply(response.headers_mut());
        response
    }

    async fn dispatch(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<ResponseBody> {
        for stage in &self.stages {
            match self.offer(stage, req, client_addr).await {
                Outcome::Respond(response) => {
                    debug!(stage = stage.name(), status = %response.status(), "Request handled");
                    return response;
                }
                Outcome::Pass(unclaimed) => req = unclaimed,
            }
        }

        crate::error::status_response(hyper::StatusCode::NOT_FOUND)
    }

    async fn offer(
        &self,
        stage: &Stage,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Outcome {
        match stage {
            Stage::Preflight if CorsPolicy::is_preflight(&req) => {
                Outcome::Respond(self.cors.preflight_response())
            }
            Stage::Forward(forwarder) if forwarder.matches(req.uri().path()) => {
                Outcome::Respond(forwarder.forward(req, client_addr).await)
            }
            Stage::Static(files) => {
                let method = req.method().clone();
                let path = req.uri().path().to_string();
                Outcome::Respond(files.serve(&method, &path).await)
            }
            _ => Outcome::Pass(req),
        }
    }
}
