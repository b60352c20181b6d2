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

use crate::{
    base::{serialize::rmp_serialize, RelayResponse},
    relayer::{server::RelayReply, RelayServer},
    Error, ErrorKind, VERSION,
};
use std::sync::Arc;
use tide::{http::mime, Request, Response, StatusCode};

/// Header selecting a service specific backend.
pub const RPC_TYPE_HEADER: &str = "Rpc-Type";

/// Conversion from "core" errors to HTTP errors.
impl From<ErrorKind> for StatusCode {
    fn from(err: ErrorKind) -> StatusCode {
        use crate::error::ErrorKind::*;
        match err {
            MalformedData => StatusCode::BadRequest,
            InvalidSignature | WrongCurve => StatusCode::Unauthorized,
            InvalidSession => StatusCode::Forbidden,
            RateLimited => StatusCode::TooManyRequests,
            ServiceNotConfigured | ResourceNotFound => StatusCode::NotFound,
            SupplierUnreachable => StatusCode::BadGateway,
            Timeout => StatusCode::GatewayTimeout,
            NotImplemented => StatusCode::NotImplemented,
            Internal => StatusCode::InternalServerError,
        }
    }
}

fn tide_result(reply: RelayReply) -> tide::Result {
    let status = reply.error.map(StatusCode::from).unwrap_or(StatusCode::Ok);
    let response = Response::builder(status)
        .body(reply.body)
        .content_type(mime::BYTE_STREAM)
        .build();
    Ok(response)
}

/// Websocket upgrade requests ask for the streaming path.
fn is_upgrade(req: &Request<Arc<RelayServer>>) -> bool {
    let upgrade = req
        .header("Upgrade")
        .map(|values| values.last().as_str().eq_ignore_ascii_case("websocket"))
        .unwrap_or_default();
    let connection = req
        .header("Connection")
        .map(|values| {
            values
                .last()
                .as_str()
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or_default();
    upgrade && connection
}

fn rejection(err: Error) -> RelayReply {
    let res = RelayResponse::from_error(None, &err);
    RelayReply {
        error: Some(err.kind),
        body: rmp_serialize(&res).unwrap_or_default(),
    }
}

async fn relay_handler(mut req: Request<Arc<RelayServer>>) -> tide::Result {
    if is_upgrade(&req) {
        return tide_result(rejection(Error::new_ext(
            ErrorKind::NotImplemented,
            "streaming relays are not supported",
        )));
    }
    let service_id = req.param("service_id").ok().map(|id| id.to_owned());
    let rpc_type = req
        .header(RPC_TYPE_HEADER)
        .map(|values| values.last().as_str().to_owned());

    let max_body_size = req
        .state()
        .config()
        .max_body_size(service_id.as_deref().unwrap_or_default());
    if req.len().unwrap_or_default() > max_body_size {
        return tide_result(rejection(Error::new_ext(
            ErrorKind::MalformedData,
            "request body too large",
        )));
    }

    let body = req.body_bytes().await?;
    let reply = req
        .state()
        .serve(&body, service_id.as_deref(), rpc_type.as_deref())
        .await;
    tide_result(reply)
}

async fn get_index(_req: Request<Arc<RelayServer>>) -> tide::Result {
    Ok(format!("RelayMiner v{}", VERSION).into())
}

pub fn run(addr: String, port: u16, server: Arc<RelayServer>) {
    let mut app = tide::with_state(server);

    app.at("/").get(get_index);
    app.at("/").post(relay_handler);
    app.at("/:service_id").post(relay_handler);

    let fut = app.listen((addr, port));
    if let Err(err) = async_std::task::block_on(fut) {
        error!("REST listener: {}", err);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        base::serialize::{rmp_deserialize, rmp_serialize},
        channel,
        client::tests::FakeChain,
        relayer::{
            authenticator::tests::create_test_authenticator,
            backend::{MockBackend, ServiceResponse},
            config::{tests::create_test_config, BackendConfig, MiningSupervisorConfig},
            meter::tests::create_test_meter,
            RelayMiningSupervisor, SessionCache,
        },
    };
    use std::{
        io::Read,
        sync::atomic::{AtomicU16, Ordering},
        thread,
    };
    use ureq::Response;

    /// Relay server over a fake chain and a mocked backend answering 200,
    /// along with the chain and the served operator.
    pub fn create_test_server() -> (Arc<RelayServer>, Arc<FakeChain>, String) {
        let chain = Arc::new(FakeChain::new(6));
        let mut config = create_test_config("anvil", "http://localhost:8547");
        if let Some(service) = config.services.get_mut("anvil") {
            service.rpc_backends.insert(
                "rest".to_owned(),
                BackendConfig {
                    url: "http://rest.local".to_owned(),
                    ..Default::default()
                },
            );
        }
        let (authenticator, _, operator) = create_test_authenticator(&chain, &mut config);
        let meter = create_test_meter(&chain);
        let session_cache = Arc::new(SessionCache::new());
        let (tx_sink, _rx_sink) = channel::bounded_channel(16);
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
        let mut backend = MockBackend::new();
        backend.expect_send().returning(|req| {
            Ok(ServiceResponse {
                status: 200,
                headers: vec![],
                body: req.url.into_bytes(),
            })
        });
        let server = RelayServer::new(
            config,
            authenticator,
            meter,
            session_cache,
            supervisor,
            Arc::new(backend),
        );
        (Arc::new(server), chain, operator)
    }

    fn start_listener() -> (String, Arc<FakeChain>, String) {
        static PORT: AtomicU16 = AtomicU16::new(9100);
        let port = PORT.fetch_add(1, Ordering::SeqCst);
        let addr = format!("http://localhost:{}", port);

        let (server, chain, operator) = create_test_server();

        thread::spawn(move || {
            run("localhost".to_string(), port, server);
        });

        let mut trials = 3;
        loop {
            match ureq::get(&addr).call() {
                Ok(_) => break,
                Err(_) if trials > 0 => {
                    trials -= 1;
                    std::thread::sleep(std::time::Duration::from_secs(1));
                }
                _ => panic!("connection refused"),
            }
        }
        (addr, chain, operator)
    }

    fn relay_body(chain: &FakeChain, operator: &str) -> Vec<u8> {
        let app = chain.add_application(1_000_000);
        let req = chain.signed_request(&app.address, &app, operator, 6);
        rmp_serialize(&req).unwrap()
    }

    fn fetch_relay_response(response: Response) -> RelayResponse {
        let mut body = vec![];
        response.into_reader().read_to_end(&mut body).unwrap();
        rmp_deserialize(&body).unwrap()
    }

    fn fetch_error_response(err: ureq::Error) -> Response {
        match err {
            ureq::Error::Status(_code, response) => response,
            result => panic!("Unexpected result: {:?}", result),
        }
    }

    #[test]
    fn error_kinds_to_status_codes() {
        assert_eq!(StatusCode::from(ErrorKind::RateLimited), StatusCode::TooManyRequests);
        assert_eq!(StatusCode::from(ErrorKind::InvalidSession), StatusCode::Forbidden);
        assert_eq!(StatusCode::from(ErrorKind::SupplierUnreachable), StatusCode::BadGateway);
        assert_eq!(StatusCode::from(ErrorKind::Timeout), StatusCode::GatewayTimeout);
        assert_eq!(StatusCode::from(ErrorKind::Internal), StatusCode::InternalServerError);
    }

    #[test]
    fn index_test() {
        let (addr, _, _) = start_listener();

        let response: ureq::Response = ureq::get(&addr).call().unwrap();

        assert_eq!(response.content_type(), "text/plain");
        assert_eq!(
            response.into_string().unwrap(),
            format!("RelayMiner v{}", VERSION)
        );
    }

    #[test]
    fn relay_served() {
        let (addr, chain, operator) = start_listener();
        let body = relay_body(&chain, &operator);

        let response = ureq::post(&format!("{}/anvil", addr))
            .send_bytes(&body)
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.content_type(), "application/octet-stream");
        let res = fetch_relay_response(response);
        assert_eq!(res.status_code, 200);
        let service_res = ServiceResponse::from_payload(&res.payload).unwrap();
        assert_eq!(service_res.body, b"http://localhost:8547");
    }

    #[test]
    fn relay_with_rpc_type() {
        let (addr, chain, operator) = start_listener();
        let body = relay_body(&chain, &operator);

        let response = ureq::post(&addr)
            .set(RPC_TYPE_HEADER, "rest")
            .send_bytes(&body)
            .unwrap();

        let res = fetch_relay_response(response);
        let service_res = ServiceResponse::from_payload(&res.payload).unwrap();
        assert_eq!(service_res.body, b"http://rest.local");
    }

    #[test]
    fn malformed_relay() {
        let (addr, _, _) = start_listener();

        let err = ureq::post(&addr).send_bytes(&[0xc1, 0x00]).unwrap_err();

        let response = fetch_error_response(err);
        assert_eq!(response.status(), 400);
        let res = fetch_relay_response(response);
        assert_eq!(res.error.unwrap().kind, ErrorKind::MalformedData);
    }

    #[test]
    fn operator_not_served() {
        let (addr, chain, _) = start_listener();
        let body = relay_body(&chain, "pokt1elsewhere");

        let err = ureq::post(&addr).send_bytes(&body).unwrap_err();

        assert_eq!(fetch_error_response(err).status(), 502);
    }

    #[test]
    fn websocket_upgrade_not_implemented() {
        let (addr, _, _) = start_listener();

        let err = ureq::post(&addr)
            .set("Upgrade", "websocket")
            .set("Connection", "keep-alive, Upgrade")
            .send_bytes(&[])
            .unwrap_err();

        let response = fetch_error_response(err);
        assert_eq!(response.status(), 501);
        let res = fetch_relay_response(response);
        assert_eq!(res.error.unwrap().kind, ErrorKind::NotImplemented);
    }
}
