use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use agent_relay_core::{AgentToken, TreeFetcher};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tonic::{Request, Response, Status};
use tracing::{debug, debug_span, instrument, Instrument};
use uuid::Uuid;

use crate::api::RelayApi;
use crate::config::RelaySettings;
use crate::configuration::ConfigurationSession;
use crate::gitops::ObjectsSession;
use crate::proto::agent_relay_server::AgentRelay;
use crate::proto::*;
use crate::stream::{StreamContext, StreamSender};
use crate::usage::Counter;

/// Frames buffered per stream before a session waits for the agent.
const STREAM_BUFFER: usize = 4;

/// Implementation of the AgentRelay gRPC service.
pub struct AgentRelayServiceImpl {
    api: Arc<RelayApi>,
    fetcher: Arc<dyn TreeFetcher>,
    settings: RelaySettings,
    sync_count: Counter,
    shutdown: StreamContext,
}

impl AgentRelayServiceImpl {
    /// # Arguments
    /// * `sync_count` - Bumped once per delivered GitOps turn
    /// * `shutdown` - Cancelled when the process stops; ends every open stream
    pub fn new(
        api: Arc<RelayApi>,
        fetcher: Arc<dyn TreeFetcher>,
        settings: RelaySettings,
        sync_count: Counter,
        shutdown: StreamContext,
    ) -> Self {
        Self {
            api,
            fetcher,
            settings,
            sync_count,
            shutdown,
        }
    }

    /// Extract the agent token from the `authorization: Bearer <token>` entry.
    fn agent_token<T>(request: &Request<T>) -> Result<AgentToken, Status> {
        let value = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("authorization metadata is required"))?
            .to_str()
            .map_err(|_| Status::unauthenticated("malformed authorization metadata"))?;
        match value.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() => {
                Ok(AgentToken::new(token))
            }
            _ => Err(Status::unauthenticated("bearer token is required")),
        }
    }

    /// Run `session` in its own task, feeding the returned stream.
    ///
    /// The session is cancelled when the agent goes away or the process
    /// shuts down. An error it returns becomes the last item of the stream.
    fn serve_stream<T, F, Fut>(&self, method: &'static str, session: F) -> StreamResult<T>
    where
        T: Send + 'static,
        F: FnOnce(StreamSender<T>) -> Fut,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let (canceller, ctx) = StreamContext::new();
        let sender = StreamSender::new(tx.clone(), ctx);
        let session = session(sender.clone());
        let shutdown = self.shutdown.clone();
        let span = debug_span!("stream", method, stream_id = %Uuid::new_v4());

        tokio::spawn(
            async move {
                debug!("Stream opened");
                tokio::pin!(session);
                let result = tokio::select! {
                    res = &mut session => res,
                    _ = tx.closed() => {
                        debug!("Agent went away");
                        canceller.cancel();
                        session.await
                    }
                    _ = shutdown.cancelled() => {
                        canceller.cancel();
                        session.await
                    }
                };
                drop(tx);

                match result {
                    Ok(()) => debug!("Stream closed"),
                    Err(status) => {
                        debug!(code = ?status.code(), "Stream closed with error");
                        let _ = sender.send_error(status).await;
                    }
                }
            }
            .instrument(span),
        );

        Box::pin(ReceiverStream::new(rx))
    }
}

type StreamResult<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl AgentRelay for AgentRelayServiceImpl {
    type GetConfigurationStream = StreamResult<ConfigurationResponse>;
    type GetObjectsToSynchronizeStream = StreamResult<ObjectsToSynchronizeResponse>;

    #[instrument(skip(self, request), level = "debug")]
    async fn get_configuration(
        &self,
        request: Request<ConfigurationRequest>,
    ) -> Result<Response<Self::GetConfigurationStream>, Status> {
        let token = Self::agent_token(&request)?;
        let req = request.into_inner();

        let api = self.api.clone();
        let fetcher = self.fetcher.clone();
        let settings = self.settings;
        let stream = self.serve_stream("GetConfiguration", move |sender| {
            ConfigurationSession::new(api, fetcher, settings, sender, token, req.commit_id).run()
        });
        Ok(Response::new(stream))
    }

    #[instrument(skip(self, request), level = "debug", fields(project_id = %request.get_ref().project_id))]
    async fn get_objects_to_synchronize(
        &self,
        request: Request<ObjectsToSynchronizeRequest>,
    ) -> Result<Response<Self::GetObjectsToSynchronizeStream>, Status> {
        let token = Self::agent_token(&request)?;
        let req = request.into_inner();
        if req.project_id.is_empty() {
            return Err(Status::invalid_argument("project_id is required"));
        }
        let paths: Vec<String> = req.paths.into_iter().map(|p| p.glob).collect();

        let api = self.api.clone();
        let fetcher = self.fetcher.clone();
        let settings = self.settings;
        let sync_count = self.sync_count.clone();
        let stream = self.serve_stream("GetObjectsToSynchronize", move |sender| {
            ObjectsSession::new(
                api,
                fetcher,
                settings,
                sync_count,
                sender,
                token,
                req.project_id,
                paths,
                req.commit_id,
            )
            .run()
        });
        Ok(Response::new(stream))
    }
}
