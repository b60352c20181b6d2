// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Synchronous relay server.
//!
//! Transport independent pipeline serving one relay request: decode and
//! validate the request, admit it, forward it to the backend within the
//! request deadline, sign the response and route the relay toward the
//! reward pipeline.
//!
//! Services validated eagerly are metered and verified before the backend
//! is contacted. Lazily validated services are served right away and the
//! relay is published to the mining supervisor for delayed checks.

use crate::{
    base::{
        serialize::{rmp_deserialize, rmp_serialize},
        Relay, RelayRequest, RelayResponse, SessionHeader,
    },
    relayer::{
        authenticator::RelayAuthenticator,
        backend::{Backend, BackendRequest, ServiceRequest},
        config::{BackendConfig, RelayMinerConfig, ValidationMode},
        meter::RelayMeter,
        session_cache::SessionCache,
        supervisor::RelayMiningSupervisor,
    },
    Error, ErrorKind, Result,
};
use async_std::{future::timeout, task};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

/// Added to the service timeout to cover signing and response write.
pub const TIMEOUT_SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// Budget granted to a stage when the request deadline is already spent.
pub const MIN_STAGE_BUDGET: Duration = Duration::from_millis(100);

/// Served relay, ready to be written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReply {
    /// Kind of the error that interrupted serving, if any.
    pub error: Option<ErrorKind>,
    /// Encoded relay response.
    pub body: Vec<u8>,
}

/// What is known about the request when serving fails.
#[derive(Default)]
struct ServeContext {
    header: Option<SessionHeader>,
    operator: Option<String>,
}

struct Deadline(Instant);

impl Deadline {
    fn remaining(&self) -> Duration {
        self.0
            .saturating_duration_since(Instant::now())
            .max(MIN_STAGE_BUDGET)
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// Run a stage within the remaining budget.
    async fn run<F: Future>(&self, stage: &str, fut: F) -> Result<F::Output> {
        timeout(self.remaining(), fut).await.map_err(|_| {
            Error::new_ext(ErrorKind::Timeout, format!("deadline expired during {}", stage))
        })
    }
}

pub struct RelayServer {
    config: RelayMinerConfig,
    authenticator: Arc<RelayAuthenticator>,
    meter: Arc<RelayMeter>,
    session_cache: Arc<SessionCache>,
    supervisor: Arc<RelayMiningSupervisor>,
    backend: Arc<dyn Backend>,
}

impl RelayServer {
    pub fn new(
        config: RelayMinerConfig,
        authenticator: Arc<RelayAuthenticator>,
        meter: Arc<RelayMeter>,
        session_cache: Arc<SessionCache>,
        supervisor: Arc<RelayMiningSupervisor>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        RelayServer {
            config,
            authenticator,
            meter,
            session_cache,
            supervisor,
            backend,
        }
    }

    pub fn config(&self) -> &RelayMinerConfig {
        &self.config
    }

    /// Serve one relay request.
    ///
    /// `path_service_id` is the service named by the request path, if any,
    /// and `rpc_type` selects a service specific backend. Failures are
    /// returned as a relay response carrying the error, signed whenever the
    /// addressed operator is served by this node.
    ///
    /// Failures detected before the operator is known are returned
    /// unsigned, as no signing key can be chosen for them: undecodable or
    /// oversized bodies, path/service mismatches, unconfigured services and
    /// operators not served by this node.
    pub async fn serve(
        &self,
        body: &[u8],
        path_service_id: Option<&str>,
        rpc_type: Option<&str>,
    ) -> RelayReply {
        let mut ctx = ServeContext::default();
        let (error, mut res) = match self
            .serve_relay(body, path_service_id, rpc_type, &mut ctx)
            .await
        {
            Ok(res) => (None, res),
            Err(err) => {
                match err.kind {
                    ErrorKind::Internal => error!("[server] {}", err.to_string_full()),
                    _ => debug!("[server] relay rejected: {}", err.to_string_full()),
                }
                (Some(err.kind), RelayResponse::from_error(ctx.header, &err))
            }
        };

        if error.is_some() {
            if let Some(operator) = ctx.operator.as_deref() {
                if let Err(err) = self.authenticator.sign_relay_response(&mut res, operator) {
                    warn!("[server] error response left unsigned: {}", err.to_string_full());
                }
            }
        }

        match rmp_serialize(&res) {
            Ok(body) => RelayReply { error, body },
            Err(err) => {
                error!("[server] response encoding: {}", err.to_string_full());
                RelayReply {
                    error: Some(ErrorKind::Internal),
                    body: vec![],
                }
            }
        }
    }

    fn decode_request(&self, body: &[u8], path_service_id: Option<&str>) -> Result<RelayRequest> {
        let max_body_size = self.config.max_body_size(path_service_id.unwrap_or_default());
        if body.len() > max_body_size {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("body of {} bytes exceeds {} bytes", body.len(), max_body_size),
            ));
        }
        let req: RelayRequest = rmp_deserialize(body)?;
        req.validate_basic()?;
        Ok(req)
    }

    async fn serve_relay(
        &self,
        body: &[u8],
        path_service_id: Option<&str>,
        rpc_type: Option<&str>,
        ctx: &mut ServeContext,
    ) -> Result<RelayResponse> {
        let req = self.decode_request(body, path_service_id)?;
        let header = req.meta.header()?.clone();
        ctx.header = Some(header.clone());

        if let Some(service_id) = path_service_id {
            if service_id != header.service_id {
                return Err(Error::new_ext(
                    ErrorKind::MalformedData,
                    format!(
                        "path service '{}' does not match relay service '{}'",
                        service_id, header.service_id
                    ),
                ));
            }
        }
        let backend_config = self
            .config
            .backend(&header.service_id, rpc_type)
            .ok_or_else(|| {
                Error::new_ext(
                    ErrorKind::ServiceNotConfigured,
                    format!("service '{}' not configured", header.service_id),
                )
            })?;

        let operator = req.meta.supplier_operator_address.clone();
        if !self.authenticator.is_operator_served(&operator) {
            return Err(Error::new_ext(
                ErrorKind::SupplierUnreachable,
                format!("operator {} not served by this node", operator),
            ));
        }
        ctx.operator = Some(operator.clone());
        self.authenticator
            .check_session_header_heights(&header)
            .await?;

        let entry = self
            .session_cache
            .get_or_insert(&header.session_id, header.session_end_block_height);
        if !entry.is_rewardable() {
            return Err(Error::new_ext(
                ErrorKind::RateLimited,
                format!("session {} is not rewardable", header.session_id),
            ));
        }

        let service_req = ServiceRequest::from_payload(&req.payload)?;
        let request_timeout = self.config.request_timeout(&header.service_id);
        let deadline = Deadline(Instant::now() + request_timeout + TIMEOUT_SAFETY_MARGIN);
        let mode = self.config.validation_mode(&header.service_id);

        if mode == ValidationMode::Eager {
            self.admit_eagerly(&req, &header, &deadline).await?;
        }

        // From here on an eagerly admitted relay has been charged.
        let res = self
            .forward_and_sign(service_req, backend_config, &header, &operator, &deadline)
            .await;
        let res = match res {
            Ok(res) => res,
            Err(err) => {
                if mode == ValidationMode::Eager {
                    self.meter.set_non_applicable_relay_reward(&req.meta);
                }
                return Err(err);
            }
        };

        let relay = Relay {
            req,
            res: res.clone(),
        };
        match mode {
            ValidationMode::Eager => self.settle_eagerly(relay, &deadline).await,
            ValidationMode::Lazy => self.publish_lazily(relay).await,
        }
        Ok(res)
    }

    /// Meter and verify before contacting the backend.
    async fn admit_eagerly(
        &self,
        req: &RelayRequest,
        header: &SessionHeader,
        deadline: &Deadline,
    ) -> Result<()> {
        // The charge happens on completion only, a timeout leaves nothing to roll back.
        let over_servicing = deadline
            .run("metering", self.meter.is_over_servicing(&req.meta))
            .await?;
        if over_servicing {
            self.session_cache
                .mark_non_rewardable(&header.session_id, header.session_end_block_height);
            self.meter.set_non_applicable_relay_reward(&req.meta);
            return Err(Error::new_ext(
                ErrorKind::RateLimited,
                format!("application stake exhausted for session {}", header.session_id),
            ));
        }

        let verified = deadline
            .run("verification", self.authenticator.verify_relay_request(req))
            .await
            .and_then(|res| res);
        if let Err(err) = verified {
            if err.kind.is_session_fatal() {
                self.session_cache
                    .mark_non_rewardable(&header.session_id, header.session_end_block_height);
            }
            self.meter.set_non_applicable_relay_reward(&req.meta);
            return Err(err);
        }
        Ok(())
    }

    async fn forward_and_sign(
        &self,
        service_req: ServiceRequest,
        backend_config: &BackendConfig,
        header: &SessionHeader,
        operator: &str,
        deadline: &Deadline,
    ) -> Result<RelayResponse> {
        let backend_req = BackendRequest::build(service_req, backend_config, deadline.remaining());
        let service_res = deadline
            .run("backend call", self.backend.send(backend_req))
            .await??;

        let mut res = RelayResponse::new(
            header.clone(),
            service_res.to_payload()?,
            service_res.status,
        );
        self.authenticator.sign_relay_response(&mut res, operator)?;
        if deadline.is_expired() {
            return Err(Error::new_ext(
                ErrorKind::Timeout,
                "deadline expired before response write",
            ));
        }
        Ok(res)
    }

    /// Final reward eligibility snapshot of an eagerly admitted relay.
    async fn settle_eagerly(&self, relay: Relay, deadline: &Deadline) {
        if relay.res.is_server_error() {
            self.meter.set_non_applicable_relay_reward(&relay.req.meta);
            return;
        }
        let eligible = deadline
            .run(
                "reward eligibility",
                self.authenticator.check_reward_eligibility(&relay.req),
            )
            .await
            .and_then(|res| res);
        match eligible {
            Ok(()) => {
                self.supervisor.forward(relay);
            }
            Err(err) => {
                debug!("[server] relay not rewardable: {}", err.to_string_full());
                self.meter.set_non_applicable_relay_reward(&relay.req.meta);
            }
        }
    }

    /// Hand a served relay to the supervisor, never holding the client.
    async fn publish_lazily(&self, relay: Relay) {
        if relay.res.is_server_error() {
            return;
        }
        if self.supervisor.enqueue_timeout().is_zero() {
            self.supervisor.publish(relay).await;
        } else {
            let supervisor = self.supervisor.clone();
            task::spawn(async move {
                supervisor.publish(relay).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::Mutex,
        channel::{self, ChannelError, Receiver},
        client::{tests::FakeChain, tests::TestAccount, Keyring, LocalKeyring},
        relayer::{
            authenticator::tests::{create_test_authenticator, SUPPLIER_KEY_NAME},
            backend::{MockBackend, ServiceResponse},
            config::{tests::create_test_config, MiningSupervisorConfig, ServiceConfig},
            meter::tests::{create_test_meter, TWO_RELAYS_STAKE},
        },
    };
    use async_trait::async_trait;

    const BACKEND_URL: &str = "http://localhost:8547";
    const RESULT_BODY: &[u8] = br#"{"jsonrpc":"2.0","result":"0x10","id":1}"#;

    struct TestContext {
        chain: Arc<FakeChain>,
        keyring: Arc<LocalKeyring>,
        operator: String,
        session_cache: Arc<SessionCache>,
        meter: Arc<RelayMeter>,
        supervisor: Arc<RelayMiningSupervisor>,
        server: RelayServer,
        rx_sink: Receiver<Relay>,
    }

    impl TestContext {
        fn request_body(&self, app: &TestAccount, signer: &TestAccount) -> Vec<u8> {
            let req = self.request(app, signer);
            rmp_serialize(&req).unwrap()
        }

        fn request(&self, app: &TestAccount, signer: &TestAccount) -> RelayRequest {
            self.chain
                .signed_request(&app.address, signer, &self.operator, 6)
        }

        fn serve(&self, body: &[u8]) -> (RelayReply, RelayResponse) {
            let reply = task::block_on(self.server.serve(body, Some("anvil"), None));
            let res: RelayResponse = rmp_deserialize(&reply.body).unwrap();
            (reply, res)
        }

        fn is_signed(&self, res: &RelayResponse) -> bool {
            let public = self.keyring.public_key(SUPPLIER_KEY_NAME).unwrap();
            let hash = res.signable_bytes_hash().unwrap();
            public.verify(hash.as_bytes(), &res.meta.supplier_operator_signature)
        }
    }

    fn create_backend(status: u16, times: usize) -> MockBackend {
        let mut backend = MockBackend::new();
        backend.expect_send().times(times).returning(move |_| {
            Ok(ServiceResponse {
                status,
                headers: vec![],
                body: RESULT_BODY.to_vec(),
            })
        });
        backend
    }

    fn create_context(mode: ValidationMode, backend: Arc<dyn Backend>) -> TestContext {
        let mut config = create_test_config("anvil", BACKEND_URL);
        if let Some(service) = config.services.get_mut("anvil") {
            service.validation_mode = Some(mode);
        }
        create_context_with_config(config, backend)
    }

    fn create_context_with_config(mut config: RelayMinerConfig, backend: Arc<dyn Backend>) -> TestContext {
        let chain = Arc::new(FakeChain::new(6));
        let (authenticator, keyring, operator) = create_test_authenticator(&chain, &mut config);
        let meter = create_test_meter(&chain);
        let session_cache = Arc::new(SessionCache::new());
        let (tx_sink, rx_sink) = channel::bounded_channel(16);
        let supervisor = Arc::new(RelayMiningSupervisor::new(
            &MiningSupervisorConfig {
                queue_size: 16,
                workers: 1,
                ..Default::default()
            },
            meter.clone(),
            authenticator.clone(),
            session_cache.clone(),
            chain.clone(),
            tx_sink,
        ));
        let server = RelayServer::new(
            config,
            authenticator,
            meter.clone(),
            session_cache.clone(),
            supervisor.clone(),
            backend,
        );
        TestContext {
            chain,
            keyring,
            operator,
            session_cache,
            meter,
            supervisor,
            server,
            rx_sink,
        }
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn eager_valid_relay_is_served_and_forwarded_once() {
        let ctx = create_context(ValidationMode::Eager, Arc::new(create_backend(200, 1)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let body = ctx.request_body(&app, &app);

        let (reply, res) = ctx.serve(&body);

        assert_eq!(reply.error, None);
        assert_eq!(res.status_code, 200);
        assert!(ctx.is_signed(&res));
        let service_res = ServiceResponse::from_payload(&res.payload).unwrap();
        assert_eq!(service_res.body, RESULT_BODY);
        let forwarded = ctx.rx_sink.try_recv().unwrap();
        assert_eq!(forwarded.res, res);
        assert_eq!(ctx.rx_sink.try_recv(), Err(ChannelError::RecvEmpty));
    }

    #[test]
    fn eager_over_stake_is_rate_limited_before_backend() {
        let ctx = create_context(ValidationMode::Eager, Arc::new(create_backend(200, 2)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let body = ctx.request_body(&app, &app);
        ctx.serve(&body);
        ctx.serve(&body);

        let (reply, res) = ctx.serve(&body);

        assert_eq!(reply.error, Some(ErrorKind::RateLimited));
        assert_eq!(res.error.unwrap().kind, ErrorKind::RateLimited);
        assert_eq!(ctx.rx_sink.len(), 2);
        let session_id = ctx.request(&app, &app).session_id().to_owned();
        assert_eq!(ctx.meter.snapshot(&session_id).unwrap().consumed_coin, 84);
    }

    #[test]
    fn eager_invalid_signature_is_rejected_and_latched() {
        let ctx = create_context(ValidationMode::Eager, Arc::new(create_backend(200, 0)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let stranger = ctx.chain.add_gateway();
        let req = ctx.request(&app, &stranger);
        let body = rmp_serialize(&req).unwrap();

        let (reply, res) = ctx.serve(&body);

        assert_eq!(reply.error, Some(ErrorKind::InvalidSignature));
        assert!(ctx.is_signed(&res));
        assert!(!ctx.session_cache.get(req.session_id()).unwrap().is_rewardable());
        assert_eq!(ctx.meter.snapshot(req.session_id()).unwrap().consumed_coin, 0);
    }

    #[test]
    fn eager_backend_server_error_is_not_rewarded() {
        let ctx = create_context(ValidationMode::Eager, Arc::new(create_backend(503, 1)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let req = ctx.request(&app, &app);
        let body = rmp_serialize(&req).unwrap();

        let (reply, res) = ctx.serve(&body);

        assert_eq!(reply.error, None);
        assert_eq!(res.status_code, 503);
        assert!(ctx.rx_sink.is_empty());
        assert_eq!(ctx.meter.snapshot(req.session_id()).unwrap().consumed_coin, 0);
    }

    #[test]
    fn lazy_invalid_signature_served_but_excluded() {
        let ctx = create_context(ValidationMode::Lazy, Arc::new(create_backend(200, 1)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let stranger = ctx.chain.add_gateway();
        let req = ctx.request(&app, &stranger);
        let body = rmp_serialize(&req).unwrap();
        ctx.supervisor.start();

        let (reply, res) = ctx.serve(&body);
        wait_until(|| ctx.supervisor.stats().rolled_back == 1);

        assert_eq!(reply.error, None);
        assert_eq!(res.status_code, 200);
        assert!(ctx.rx_sink.is_empty());
        assert!(!ctx.session_cache.get(req.session_id()).unwrap().is_rewardable());
        let (reply, _) = ctx.serve(&body);
        assert_eq!(reply.error, Some(ErrorKind::RateLimited));
        task::block_on(ctx.supervisor.stop());
    }

    #[test]
    fn lazy_valid_relay_is_published() {
        let ctx = create_context(ValidationMode::Lazy, Arc::new(create_backend(200, 1)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let body = ctx.request_body(&app, &app);
        ctx.supervisor.start();

        let (reply, _) = ctx.serve(&body);

        assert_eq!(reply.error, None);
        let forwarded = ctx.rx_sink.recv_timeout_sync(Duration::from_secs(1));
        assert!(forwarded.is_ok());
        task::block_on(ctx.supervisor.stop());
    }

    #[test]
    fn lazy_server_error_is_not_published() {
        let ctx = create_context(ValidationMode::Lazy, Arc::new(create_backend(500, 1)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let body = ctx.request_body(&app, &app);

        ctx.serve(&body);

        assert_eq!(ctx.supervisor.queue_len(), 0);
        assert_eq!(ctx.supervisor.stats().enqueued, 0);
    }

    #[test]
    fn malformed_body() {
        let ctx = create_context(ValidationMode::Eager, Arc::new(create_backend(200, 0)));

        let (reply, res) = ctx.serve(b"definitely not messagepack");

        assert_eq!(reply.error, Some(ErrorKind::MalformedData));
        assert!(res.meta.session_header.is_none());
        assert!(res.meta.supplier_operator_signature.is_empty());
    }

    #[test]
    fn oversized_body() {
        let mut config = create_test_config("anvil", BACKEND_URL);
        config.max_body_size = 16;
        let ctx = create_context_with_config(config, Arc::new(create_backend(200, 0)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let body = ctx.request_body(&app, &app);

        let (reply, _) = ctx.serve(&body);

        assert_eq!(reply.error, Some(ErrorKind::MalformedData));
    }

    #[test]
    fn path_service_mismatch() {
        let ctx = create_context(ValidationMode::Eager, Arc::new(create_backend(200, 0)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let body = ctx.request_body(&app, &app);

        let reply = task::block_on(ctx.server.serve(&body, Some("other"), None));

        assert_eq!(reply.error, Some(ErrorKind::MalformedData));
    }

    #[test]
    fn service_not_configured() {
        let mut config = create_test_config("anvil", BACKEND_URL);
        config.services.clear();
        let ctx = create_context_with_config(config, Arc::new(create_backend(200, 0)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let body = ctx.request_body(&app, &app);

        let (reply, _) = ctx.serve(&body);

        assert_eq!(reply.error, Some(ErrorKind::ServiceNotConfigured));
    }

    #[test]
    fn operator_not_served() {
        let ctx = create_context(ValidationMode::Eager, Arc::new(create_backend(200, 0)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let req = ctx.chain.signed_request(&app.address, &app, "pokt1elsewhere", 6);
        let body = rmp_serialize(&req).unwrap();

        let (reply, res) = ctx.serve(&body);

        assert_eq!(reply.error, Some(ErrorKind::SupplierUnreachable));
        assert!(res.meta.supplier_operator_signature.is_empty());
        assert!(ctx.session_cache.is_empty());
    }

    #[test]
    fn rpc_type_selects_backend() {
        let mut config = create_test_config("anvil", BACKEND_URL);
        if let Some(service) = config.services.get_mut("anvil") {
            service.rpc_backends.insert(
                "rest".to_owned(),
                BackendConfig {
                    url: "http://rest.local/api".to_owned(),
                    ..Default::default()
                },
            );
        }
        let mut backend = MockBackend::new();
        backend
            .expect_send()
            .withf(|req| req.url == "http://rest.local/api")
            .times(1)
            .returning(|_| {
                Ok(ServiceResponse {
                    status: 200,
                    ..Default::default()
                })
            });
        let ctx = create_context_with_config(config, Arc::new(backend));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let body = ctx.request_body(&app, &app);

        let reply = task::block_on(ctx.server.serve(&body, Some("anvil"), Some("rest")));

        assert_eq!(reply.error, None);
    }

    #[test]
    fn backend_unreachable_is_signed_error() {
        let mut backend = MockBackend::new();
        backend
            .expect_send()
            .returning(|_| Err(Error::new_ext(ErrorKind::SupplierUnreachable, "refused")));
        let ctx = create_context(ValidationMode::Eager, Arc::new(backend));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let req = ctx.request(&app, &app);
        let body = rmp_serialize(&req).unwrap();

        let (reply, res) = ctx.serve(&body);

        assert_eq!(reply.error, Some(ErrorKind::SupplierUnreachable));
        assert!(ctx.is_signed(&res));
        assert_eq!(ctx.meter.snapshot(req.session_id()).unwrap().consumed_coin, 0);
    }

    #[test]
    fn forged_session_end_height_is_rejected() {
        let ctx = create_context(ValidationMode::Eager, Arc::new(create_backend(200, 0)));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let mut req = ctx.request(&app, &app);
        if let Some(header) = req.meta.session_header.as_mut() {
            header.session_end_block_height = u64::MAX;
        }
        ctx.chain.sign_request(&mut req, &app);
        let body = rmp_serialize(&req).unwrap();

        let (reply, res) = ctx.serve(&body);

        assert_eq!(reply.error, Some(ErrorKind::InvalidSession));
        assert!(ctx.is_signed(&res));
        assert!(ctx.session_cache.is_empty());
        assert!(ctx.meter.snapshot(req.session_id()).is_none());
    }

    /// Backend moving the chain to a given height while the relay is served.
    struct AdvancingBackend {
        chain: Mutex<Option<Arc<FakeChain>>>,
        height: u64,
    }

    #[async_trait]
    impl Backend for AdvancingBackend {
        async fn send(&self, _req: BackendRequest) -> Result<ServiceResponse> {
            if let Some(chain) = self.chain.lock().as_ref() {
                chain.set_height(self.height);
            }
            Ok(ServiceResponse {
                status: 200,
                body: RESULT_BODY.to_vec(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn eager_session_expired_during_backend_call_is_not_rewarded() {
        let backend = Arc::new(AdvancingBackend {
            chain: Mutex::new(None),
            height: 11,
        });
        let ctx = create_context(ValidationMode::Eager, backend.clone());
        *backend.chain.lock() = Some(ctx.chain.clone());
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let req = ctx.request(&app, &app);
        let body = rmp_serialize(&req).unwrap();

        let (reply, res) = ctx.serve(&body);

        assert_eq!(reply.error, None);
        assert_eq!(res.status_code, 200);
        assert!(ctx.is_signed(&res));
        assert!(ctx.rx_sink.is_empty());
        assert_eq!(ctx.meter.snapshot(req.session_id()).unwrap().consumed_coin, 0);
    }

    /// Backend answering after a fixed delay.
    struct SlowBackend(Duration);

    #[async_trait]
    impl Backend for SlowBackend {
        async fn send(&self, _req: BackendRequest) -> Result<ServiceResponse> {
            task::sleep(self.0).await;
            Ok(ServiceResponse::default())
        }
    }

    #[test]
    fn backend_timeout() {
        let mut config = create_test_config("anvil", BACKEND_URL);
        config.services.insert(
            "anvil".to_owned(),
            ServiceConfig {
                validation_mode: Some(ValidationMode::Lazy),
                request_timeout_secs: Some(1),
                backend: BackendConfig {
                    url: BACKEND_URL.to_owned(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let ctx = create_context_with_config(config, Arc::new(SlowBackend(Duration::from_secs(3))));
        let app = ctx.chain.add_application(TWO_RELAYS_STAKE);
        let body = ctx.request_body(&app, &app);
        let started = Instant::now();

        let (reply, _) = ctx.serve(&body);

        assert_eq!(reply.error, Some(ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(ctx.supervisor.stats().enqueued, 0);
    }
}
