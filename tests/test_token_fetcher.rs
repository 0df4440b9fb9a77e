//! Token exchange against a mocked auth server

use brokerlink::auth::{challenge_response, TokenError, TokenFetcher, TokenSource};
use brokerlink::broker::BrokerConnection;
use brokerlink::config::{BrokerConfig, Credentials, Settings};
use brokerlink::testing::MockConnector;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> TokenFetcher {
    TokenFetcher::new(Duration::from_secs(5)).unwrap()
}

async fn mount_exchange(server: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path("/challenge"))
        .and(query_param("login", "u"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"challenge": "abc"})))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_json(json!({
            "login": "u",
            "challenge": challenge_response("abc", "u", "p")
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": token})))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_fetch_token_answers_challenge() {
    let server = MockServer::start().await;
    mount_exchange(&server, "tok-1").await;

    let token = fetcher().fetch_token("u", "p", &server.uri()).await.unwrap();
    assert_eq!(token, "tok-1");
}

#[tokio::test]
async fn test_trailing_slash_on_server_is_ignored() {
    let server = MockServer::start().await;
    mount_exchange(&server, "tok-2").await;

    let token = fetcher()
        .fetch_token("u", "p", &format!("{}/", server.uri()))
        .await
        .unwrap();
    assert_eq!(token, "tok-2");
}

#[tokio::test]
async fn test_missing_credentials_make_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let fetcher = fetcher();
    for (user, password) in [("", "p"), ("u", "")] {
        let result = fetcher.fetch_token(user, password, &server.uri()).await;
        assert_eq!(result, Err(TokenError::MissingCredentials));
    }
    assert_eq!(
        fetcher.fetch_token("u", "p", "").await,
        Err(TokenError::MissingCredentials)
    );
}

#[tokio::test]
async fn test_challenge_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/challenge"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let result = fetcher().fetch_token("u", "p", &server.uri()).await;
    assert!(matches!(result, Err(TokenError::Challenge(_))));
}

#[tokio::test]
async fn test_login_without_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/challenge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"challenge": "abc"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({"error": "denied"})))
        .mount(&server)
        .await;

    let result = fetcher().fetch_token("u", "p", &server.uri()).await;
    assert!(matches!(result, Err(TokenError::Login(_))));
}

#[tokio::test]
async fn test_unreachable_server() {
    // Nothing listens on port 1
    let result = fetcher().fetch_token("u", "p", "http://127.0.0.1:1").await;
    assert!(matches!(result, Err(TokenError::Challenge(_))));
}

#[tokio::test]
async fn test_connection_uses_fetched_token_as_password() {
    let server = MockServer::start().await;
    mount_exchange(&server, "tok-3").await;

    let settings = Settings::default();
    let connector = Arc::new(MockConnector::new());
    let broker = BrokerConfig::new("broker.local", 1883)
        .with_credentials(Credentials::new("u", "p", server.uri()))
        .normalize();
    let connection = BrokerConnection::new(broker, &settings, connector.clone(), Arc::new(fetcher()));

    connection.connect().await;

    let link = connector.wait_for_link(0, Duration::from_secs(2)).await;
    let credentials = link.options().credentials.clone().unwrap();
    assert_eq!(credentials.username, settings.token_username);
    assert_eq!(credentials.password, "tok-3");
}

#[tokio::test]
async fn test_connection_proceeds_without_token_on_failure() {
    let settings = Settings::default();
    let connector = Arc::new(MockConnector::new());
    let broker = BrokerConfig::new("broker.local", 1883)
        .with_credentials(Credentials::new("u", "p", "http://127.0.0.1:1"))
        .normalize();
    let connection = BrokerConnection::new(broker, &settings, connector.clone(), Arc::new(fetcher()));

    connection.connect().await;

    let link = connector.wait_for_link(0, Duration::from_secs(2)).await;
    assert!(link.options().credentials.is_none());
}

#[tokio::test]
async fn test_token_source_trait_object() {
    let server = MockServer::start().await;
    mount_exchange(&server, "tok-4").await;

    let source: Arc<dyn TokenSource> = Arc::new(fetcher());
    let token = source
        .fetch(&Credentials::new("u", "p", server.uri()))
        .await
        .unwrap();
    assert_eq!(token, "tok-4");
}
