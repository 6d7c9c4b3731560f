use super::{ConnectorError, PlatformConnector};
use crate::signing::SignedRequest;
use async_trait::async_trait;
use domain::{Envelope, Platform, ReceiveOrderAck, RemoteStatus};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// The platforms' shared REST protocol: `POST /order/receive`,
/// `GET /order/status`, `POST /order/cancel`, all answering with a `code`
/// envelope.
#[derive(Clone)]
pub struct SignedRestConnector {
    http: reqwest::Client,
    dispatch_timeout: Duration,
    query_timeout: Duration,
}

impl SignedRestConnector {
    pub fn new(dispatch_timeout: Duration, query_timeout: Duration) -> Self {
        SignedRestConnector {
            http: reqwest::Client::new(),
            dispatch_timeout,
            query_timeout,
        }
    }
}

fn endpoint(platform: &Platform, path: &str) -> String {
    format!("{}{}", platform.base_url.trim_end_matches('/'), path)
}

fn transport(e: reqwest::Error) -> ConnectorError {
    if e.is_timeout() {
        ConnectorError::Unreachable(format!("timed out: {e}"))
    } else {
        ConnectorError::Unreachable(e.to_string())
    }
}

async fn read_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<Envelope<T>, ConnectorError> {
    let status = resp.status();
    let body = resp.bytes().await.map_err(transport)?;
    match serde_json::from_slice::<Envelope<T>>(&body) {
        Ok(envelope) => Ok(envelope),
        Err(_) if status.is_server_error() => Err(ConnectorError::Unreachable(format!("HTTP {status}"))),
        Err(e) => Err(ConnectorError::InvalidResponse(format!("HTTP {status}: {e}"))),
    }
}

#[async_trait]
impl PlatformConnector for SignedRestConnector {
    async fn receive_order(
        &self,
        platform: &Platform,
        request: &SignedRequest,
    ) -> Result<Envelope<ReceiveOrderAck>, ConnectorError> {
        let resp = self
            .http
            .post(endpoint(platform, "/order/receive"))
            .timeout(self.dispatch_timeout)
            .json(&request.json_body())
            .send()
            .await
            .map_err(transport)?;
        read_envelope(resp).await
    }

    async fn query_status(
        &self,
        platform: &Platform,
        request: &SignedRequest,
    ) -> Result<Envelope<RemoteStatus>, ConnectorError> {
        let resp = self
            .http
            .get(endpoint(platform, "/order/status"))
            .timeout(self.query_timeout)
            .query(&request.query_pairs())
            .send()
            .await
            .map_err(transport)?;
        read_envelope(resp).await
    }

    async fn cancel_order(
        &self,
        platform: &Platform,
        request: &SignedRequest,
    ) -> Result<Envelope<Value>, ConnectorError> {
        let resp = self
            .http
            .post(endpoint(platform, "/order/cancel"))
            .timeout(self.query_timeout)
            .json(&request.json_body())
            .send()
            .await
            .map_err(transport)?;
        read_envelope(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{self, SignParams};
    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn platform(base_url: &str) -> Platform {
        Platform {
            code: "banxia".into(),
            display_name: "Banxia".into(),
            api_key: "ak_test".into(),
            api_secret: SecretString::from("sk_test".to_string()),
            base_url: base_url.into(),
            callback_url: None,
            ip_whitelist: None,
            active: true,
        }
    }

    fn connector() -> SignedRestConnector {
        SignedRestConnector::new(Duration::from_millis(300), Duration::from_millis(300))
    }

    #[tokio::test]
    async fn receive_order_posts_signed_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/delivery/order/receive"))
            .and(|req: &Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
                let Some(obj) = body.as_object() else { return false };
                let sign = obj.get("sign").and_then(Value::as_str).unwrap_or("");
                signing::verify(&SignParams::from_json_object(obj), sign, "sk_test")
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "message": "success", "data": {"order_no": "DL1", "status": "pending"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = SignParams::new()
            .text("platform_code", "banxia")
            .text("external_order_no", "TEST123")
            .int("timestamp", 1_700_000_000)
            .into_signed("sk_test");
        let ack = connector()
            .receive_order(&platform(&format!("{}/api/delivery/", server.uri())), &request)
            .await
            .unwrap();
        assert!(ack.is_success());
        assert_eq!(ack.data.unwrap().order_no, "DL1");
    }

    #[tokio::test]
    async fn query_status_sends_sign_in_query() {
        let server = MockServer::start().await;
        let request = SignParams::new()
            .text("platform_code", "banxia")
            .text("order_no", "DL1")
            .int("timestamp", 1_700_000_000)
            .into_signed("sk_test");
        Mock::given(method("GET"))
            .and(path("/order/status"))
            .and(query_param("order_no", "DL1"))
            .and(query_param("sign", request.sign()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "data": {"order_no": "DL1", "status": 2, "rider_name": "Zhang"}
            })))
            .mount(&server)
            .await;

        let env = connector().query_status(&platform(&server.uri()), &request).await.unwrap();
        let data = env.data.unwrap();
        assert_eq!(data.status, "2");
        assert_eq!(data.rider_name.as_deref(), Some("Zhang"));
    }

    #[tokio::test]
    async fn server_error_without_envelope_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order/cancel"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let request = SignParams::new().text("order_no", "DL1").into_signed("sk_test");
        let err = connector().cancel_order(&platform(&server.uri()), &request).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Unreachable(_)));
    }

    #[tokio::test]
    async fn garbage_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order/receive"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let request = SignParams::new().text("external_order_no", "TEST123").into_signed("sk_test");
        let err = connector().receive_order(&platform(&server.uri()), &request).await.unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn slow_platform_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order/receive"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"code": 0, "data": {"order_no": "DL1"}}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let request = SignParams::new().text("external_order_no", "TEST123").into_signed("sk_test");
        let err = connector().receive_order(&platform(&server.uri()), &request).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Unreachable(_)));
    }
}
