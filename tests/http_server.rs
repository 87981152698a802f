//! Talks to a running HTTP server.

use std::net::SocketAddr;
use bytes::Bytes;
use reqwest::StatusCode;
use signserver::commons::crypto::oid;
use signserver::commons::crypto::token::keystore;
use signserver::commons::crypto::tsp::{
    MessageImprint, PkiStatus, TimeStampReq, TimeStampResp,
};
use signserver::constants::HTTP_HEADER_REQUEST_ID;
use signserver::daemon::config::Config;
use signserver::daemon::http::server::HttpServer;
use signserver::daemon::start::{build_core, serve};
use signserver::test;
use tempfile::TempDir;
use tokio::net::TcpListener;


struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    _data: TempDir,
    _keys: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let data = test::tmp_dir();
        let keys = test::tmp_dir();
        let (key, cert) = test::tsa_key_and_cert("CN=TSA,O=SignServer Test");
        keystore::write_entry(keys.path(), "ts", &key, &[cert], "foo123")
            .unwrap();

        let config = Config::from_toml(&format!(
            r#"
                data_dir = "{data}"
                post_limit = 4096
                key_usage_counter = "memory"

                [[workers]]
                id = 1
                name = "TSA"
                type = "timestamp"

                [workers.properties]
                CRYPTOTOKEN = "KEYSTORE"
                KEYSTOREPATH = "{keys}"
                KEYSTOREPASSWORD = "foo123"
                DEFAULTKEY = "ts"
                DEFAULTTSAPOLICYOID = "1.2.3"
                AUTHTYPE = "NOAUTH"

                [[workers]]
                id = 2
                name = "Protected"
                type = "timestamp"

                [workers.properties]
                CRYPTOTOKEN = "KEYSTORE"
                KEYSTOREPATH = "{keys}"
                KEYSTOREPASSWORD = "foo123"
                DEFAULTKEY = "ts"
                DEFAULTTSAPOLICYOID = "1.2.4"
                AUTHTYPE = "USERNAME"
                "USER.alice" = "secret"
            "#,
            data = data.path().display(),
            keys = keys.path().display(),
        )).unwrap();

        let core = build_core(&config).unwrap();
        let server = HttpServer::new(core, config.post_limit);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, server, None));

        TestServer {
            addr,
            client: reqwest::Client::new(),
            _data: data,
            _keys: keys,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post(&self, path: &str, body: Bytes) -> reqwest::Response {
        self.client.post(self.url(path)).body(body).send().await.unwrap()
    }
}

fn tsr() -> Bytes {
    TimeStampReq::new(MessageImprint {
        hash_algorithm: oid::owned(oid::SHA256),
        hashed_message: Bytes::from(vec![7u8; 32]),
    }).to_bytes()
}


#[tokio::test]
async fn health_check() {
    let server = TestServer::start().await;
    let res = server.client.get(server.url("/healthcheck"))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "ALLOK");
}

#[tokio::test]
async fn process_by_name_and_id() {
    let server = TestServer::start().await;

    let res = server.post("/signserver/process?workerName=TSA", tsr()).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers()[reqwest::header::CONTENT_TYPE],
        "application/timestamp-reply"
    );
    assert!(res.headers().contains_key(HTTP_HEADER_REQUEST_ID));
    let resp = TimeStampResp::decode(res.bytes().await.unwrap()).unwrap();
    assert_eq!(resp.status, PkiStatus::Granted);

    let res = server.post("/signserver/worker/1", tsr()).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn error_statuses() {
    let server = TestServer::start().await;

    let res = server.post(
        "/signserver/worker/TSA", Bytes::from_static(b"not a request")
    ).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = server.post("/signserver/worker/Unknown", tsr()).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = server.post("/signserver/process", tsr()).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = server.post(
        "/signserver/process?workerId=1", Bytes::from(vec![0u8; 5000])
    ).await;
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let res = server.client.get(server.url("/signserver/worker/1"))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

    let res = server.client.get(server.url("/nothing/here"))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn username_authentication() {
    let server = TestServer::start().await;

    let res = server.post("/signserver/worker/Protected", tsr()).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(res.headers().contains_key(reqwest::header::WWW_AUTHENTICATE));

    let res = server.client.post(server.url("/signserver/worker/Protected"))
        .basic_auth("alice", Some("wrong"))
        .body(tsr()).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = server.client.post(server.url("/signserver/worker/Protected"))
        .basic_auth("alice", Some("secret"))
        .body(tsr()).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn worker_status() {
    let server = TestServer::start().await;
    server.post("/signserver/worker/TSA", tsr()).await;

    let res = server.client.get(server.url("/signserver/worker/TSA/status"))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let status: serde_json::Value = serde_json::from_slice(
        &res.bytes().await.unwrap()
    ).unwrap();
    assert_eq!(status["id"], 1);
    assert_eq!(status["type"], "timestamp");
    assert_eq!(status["disabled"], false);
    assert_eq!(status["statistics"]["completed"], 1);
}

#[tokio::test]
async fn worker_status_errors() {
    let server = TestServer::start().await;

    let res = server.client.get(server.url("/signserver/worker/Nobody/status"))
        .send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = server.post("/signserver/worker/TSA/status", tsr()).await;
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

    let statuses = concurrent_checks(&server).await;
    assert!(statuses.iter().all(|status| *status == StatusCode::OK));
}

/// Asks for the status of both workers and checks health at the same time.
async fn concurrent_checks(server: &TestServer) -> Vec<StatusCode> {
    let status = |worker: &str| {
        server.client.get(server.url(
            &format!("/signserver/worker/{worker}/status")
        )).send()
    };
    let health = server.client.get(server.url("/healthcheck")).send();
    let (tsa, protected, health) = tokio::join!(
        status("TSA"), status("Protected"), health
    );
    vec![
        tsa.unwrap().status(),
        protected.unwrap().status(),
        health.unwrap().status(),
    ]
}
