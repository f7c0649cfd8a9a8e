//! HTTPS client for the Sydpower serverless backend.
//!
//! All RPCs go through one POST endpoint with an HMAC-MD5 signature over the
//! sorted request fields in the `x-serverless-sign` header. Authentication is
//! two-stage: an anonymous authorize yields the signing identity, a login
//! invoke yields the access token used by the remaining RPCs. The client also
//! fetches the MQTT credentials and the account's device list.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::logger::SmartLogger;

/// Single serverless endpoint for every RPC.
const ENDPOINT: &str = "https://api.next.bspapp.com/client";

/// Identifies the vendor's serverless space. Shipped with the vendor app.
const SPACE_ID: &str = "mp-6c382a98-49b8-40ba-b761-645d83e8ee74";

/// Signing secret paired with the space id. Shipped with the vendor app.
const CLIENT_SECRET: &str = "5rCEdl/nx7IgViBe4QYRiQ==";

/// The backend drops requests whose user-agent does not look like the app.
const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 10; SM-A426B) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/87.0.4280.86 Mobile Safari/537.36";

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

type HmacMd5 = Hmac<Md5>;

/// A device record from the API, keyed by its MAC with colons stripped.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub name: Option<String>,
    /// Modbus unit id override from `productInfo`, when present.
    pub modbus_address: Option<u8>,
    /// Register-count override from `productInfo`, when present.
    pub modbus_count: Option<u16>,
}

/// MQTT credentials plus optional broker hints from the API.
#[derive(Debug, Clone)]
pub struct MqttInfo {
    pub token: String,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Client for the Fossibot/Sydpower cloud API.
pub struct ApiClient {
    http: reqwest::Client,
    logger: SmartLogger,
    /// Synthesised per-session device id, stable across requests.
    device_id: String,
    auth_token: Option<String>,
    access_token: Option<String>,
}

impl ApiClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| Error::Network(err.to_string()))?;
        const HEX: &[u8] = b"0123456789ABCDEF";
        let mut rng = rand::thread_rng();
        let device_id: String = (0..32)
            .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
            .collect();
        Ok(Self {
            http,
            logger: SmartLogger::new("sydpower::api"),
            device_id,
            auth_token: None,
            access_token: None,
        })
    }

    /// Android client identity sent as `clientInfo` with every function
    /// invoke. Must stay stable within a session.
    fn client_info(&self) -> Value {
        json!({
            "PLATFORM": "app",
            "OS": "android",
            "APPID": "__UNI__55F5E7F",
            "DEVICEID": self.device_id,
            "channel": "google",
            "scene": 1001,
            "appId": "__UNI__55F5E7F",
            "appLanguage": "en",
            "appName": "BrightEMS",
            "appVersion": "1.2.3",
            "appVersionCode": 123,
            "appWgtVersion": "1.2.3",
            "browserName": "chrome",
            "browserVersion": "130.0.6723.86",
            "deviceBrand": "Samsung",
            "deviceId": self.device_id,
            "deviceModel": "SM-A426B",
            "deviceType": "phone",
            "osName": "android",
            "osVersion": 10,
            "romName": "Android",
            "romVersion": 10,
            "ua": USER_AGENT,
            "uniPlatform": "app",
            "uniRuntimeVersion": "4.24",
            "locale": "en",
            "LOCALE": "en",
        })
    }

    /// Serialises a function-runtime invocation body.
    fn build_function_params(&self, url: &str, data: Value, token: Option<&str>) -> String {
        let mut args = json!({
            "$url": url,
            "data": data,
            "clientInfo": self.client_info(),
        });
        if let Some(token) = token {
            args["uniIdToken"] = Value::String(token.to_string());
        }
        json!({ "functionTarget": "router", "functionArgs": args }).to_string()
    }

    /// One signed RPC with retries. Returns the whole response body.
    async fn call_api(&self, method: &str, params: &str, token: Option<&str>) -> Result<Value> {
        let mut last_error = Error::Network("no attempt made".to_string());

        for attempt in 0..MAX_RETRIES {
            match self.call_api_once(method, params, token).await {
                Ok(body) => return Ok(body),
                Err(err) => {
                    self.logger.error(&format!(
                        "API call {method} failed (attempt {}/{MAX_RETRIES}): {err}",
                        attempt + 1
                    ));
                    last_error = err;
                    if attempt + 1 < MAX_RETRIES {
                        tokio::time::sleep(RETRY_DELAY * (attempt + 1)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn call_api_once(&self, method: &str, params: &str, token: Option<&str>) -> Result<Value> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let timestamp_str = timestamp.to_string();

        let mut fields: Vec<(&str, &str)> = vec![
            ("method", method),
            ("params", params),
            ("spaceId", SPACE_ID),
            ("timestamp", &timestamp_str),
        ];
        if let Some(token) = token {
            fields.push(("token", token));
        }
        let signature = sign(CLIENT_SECRET.as_bytes(), &signed_query(&fields));

        let mut body = json!({
            "method": method,
            "params": params,
            "spaceId": SPACE_ID,
            "timestamp": timestamp,
        });
        if let Some(token) = token {
            body["token"] = Value::String(token.to_string());
        }

        let resp = self
            .http
            .post(ENDPOINT)
            .header("Content-Type", "application/json")
            .header("x-serverless-sign", signature)
            .header("user-agent", USER_AGENT)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() != 200 {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(Error::Network(format!(
                "API request failed with status {status}: {snippet}"
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|err| Error::Protocol(format!("malformed API response: {err}")))?;
        if body.get("data").map_or(true, Value::is_null) {
            return Err(Error::Protocol(format!(
                "API request returned no data: {body}"
            )));
        }
        Ok(body)
    }

    /// Two-stage login: anonymous authorize for the signing identity, then a
    /// credential login for the access token.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let auth_resp = self
            .call_api("serverless.auth.user.anonymousAuthorize", "{}", None)
            .await?;
        let auth_token = auth_resp["data"]["accessToken"]
            .as_str()
            .ok_or_else(|| Error::Auth("no anonymous access token in response".to_string()))?
            .to_string();

        let login_params = self.build_function_params(
            "user/pub/login",
            json!({ "locale": "en", "username": username, "password": password }),
            None,
        );
        let login_resp = self
            .call_api(
                "serverless.function.runtime.invoke",
                &login_params,
                Some(&auth_token),
            )
            .await?;
        let access_token = login_resp["data"]["token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Auth("login failed - no token in response".to_string()))?;

        self.auth_token = Some(auth_token);
        self.access_token = Some(access_token);
        Ok(())
    }

    fn tokens(&self) -> Result<(&str, &str)> {
        match (self.auth_token.as_deref(), self.access_token.as_deref()) {
            (Some(auth), Some(access)) => Ok((auth, access)),
            _ => Err(Error::Auth("must authenticate first".to_string())),
        }
    }

    /// Fetches the MQTT token plus whatever broker hints the deployment
    /// chooses to include.
    pub async fn get_mqtt_info(&self) -> Result<MqttInfo> {
        let (auth_token, access_token) = self.tokens()?;
        let params = self.build_function_params(
            "common/emqx.getAccessToken",
            json!({ "locale": "en" }),
            Some(access_token),
        );
        let resp = self
            .call_api("serverless.function.runtime.invoke", &params, Some(auth_token))
            .await?;
        let data = &resp["data"];

        let token = data["access_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Auth("no MQTT token in response".to_string()))?;

        let host = extract_mqtt_host(data);
        let port = extract_mqtt_port(data);
        if let Some(host) = &host {
            self.logger.info(&format!("API returned MQTT host: {host}"));
        }

        Ok(MqttInfo { token, host, port })
    }

    /// Fetches the account's devices. Records without a usable id are logged
    /// and skipped rather than failing the whole list.
    pub async fn get_devices(&self) -> Result<HashMap<String, Device>> {
        let (auth_token, access_token) = self.tokens()?;
        let params = self.build_function_params(
            "client/device/kh/getList",
            json!({ "locale": "en", "pageIndex": 1, "pageSize": 100 }),
            Some(access_token),
        );
        let resp = self
            .call_api("serverless.function.runtime.invoke", &params, Some(auth_token))
            .await?;

        let rows = resp["data"]["rows"].as_array().cloned().unwrap_or_default();
        let devices = parse_device_rows(&rows, &self.logger);
        self.logger
            .debug(&format!("Found {} devices", devices.len()));
        Ok(devices)
    }
}

/// Builds the signing input: `key=value` pairs of all non-empty fields,
/// sorted by key, joined with `&`.
fn signed_query(fields: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(&str, &str)> = fields
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .copied()
        .collect();
    pairs.sort_by_key(|(key, _)| *key);
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC-MD5 hex digest of the query under the client secret.
fn sign(secret: &[u8], query: &str) -> String {
    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The broker-host field name varies across deployments; probe the known
/// spellings in order.
fn extract_mqtt_host(data: &Value) -> Option<String> {
    ["mqtt_host", "host", "mqttHost", "server", "endpoint", "broker", "url", "addr"]
        .iter()
        .find_map(|key| data[*key].as_str())
        .map(str::to_string)
}

fn extract_mqtt_port(data: &Value) -> Option<u16> {
    ["mqtt_port", "port", "mqttPort"].iter().find_map(|key| {
        let value = &data[*key];
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .and_then(|p| u16::try_from(p).ok())
    })
}

fn parse_device_rows(rows: &[Value], logger: &SmartLogger) -> HashMap<String, Device> {
    let mut devices = HashMap::new();
    for row in rows {
        let raw_id = row["device_id"].as_str().unwrap_or_default();
        let id: String = raw_id.chars().filter(|c| *c != ':').collect();
        if id.is_empty() {
            logger.warning(&format!(
                "Device '{}' has no device_id in API response - skipping. \
                 Re-register the device in the Fossibot/BrightEMS app to fix this.",
                row["device_name"].as_str().unwrap_or("<unknown>")
            ));
            continue;
        }
        let product_info = &row["productInfo"];
        devices.insert(
            id.clone(),
            Device {
                id,
                name: row["device_name"].as_str().map(str::to_string),
                modbus_address: product_info["modbus_address"]
                    .as_u64()
                    .and_then(|v| u8::try_from(v).ok()),
                modbus_count: product_info["modbus_count"]
                    .as_u64()
                    .and_then(|v| u16::try_from(v).ok()),
            },
        );
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    mod signing {
        use super::*;

        #[test]
        fn query_is_sorted_by_key() {
            let query = signed_query(&[
                ("timestamp", "123"),
                ("method", "m"),
                ("spaceId", "s"),
                ("params", "{}"),
            ]);
            assert_eq!(query, "method=m&params={}&spaceId=s&timestamp=123");
        }

        #[test]
        fn empty_fields_are_skipped() {
            let query = signed_query(&[("method", "m"), ("token", ""), ("spaceId", "s")]);
            assert_eq!(query, "method=m&spaceId=s");
        }

        #[test]
        fn signature_is_deterministic_hex() {
            let a = sign(b"secret", "method=m&spaceId=s");
            let b = sign(b"secret", "method=m&spaceId=s");
            assert_eq!(a, b);
            assert_eq!(a.len(), 32);
            assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        }

        #[test]
        fn signature_depends_on_key_and_message() {
            let base = sign(b"secret", "method=m");
            assert_ne!(base, sign(b"other", "method=m"));
            assert_ne!(base, sign(b"secret", "method=n"));
        }
    }

    mod mqtt_info {
        use super::*;
        use serde_json::json;

        #[test]
        fn host_is_probed_across_known_field_names() {
            for key in ["mqtt_host", "host", "mqttHost", "server", "endpoint", "broker", "url", "addr"]
            {
                let data = json!({ key: "broker.example.com" });
                assert_eq!(
                    extract_mqtt_host(&data).as_deref(),
                    Some("broker.example.com"),
                    "field {key}"
                );
            }
            assert_eq!(extract_mqtt_host(&json!({})), None);
        }

        #[test]
        fn first_matching_host_field_wins() {
            let data = json!({ "host": "second", "mqtt_host": "first" });
            assert_eq!(extract_mqtt_host(&data).as_deref(), Some("first"));
        }

        #[test]
        fn port_accepts_numbers_and_strings() {
            assert_eq!(extract_mqtt_port(&json!({ "port": 8083 })), Some(8083));
            assert_eq!(extract_mqtt_port(&json!({ "mqtt_port": "8084" })), Some(8084));
            assert_eq!(extract_mqtt_port(&json!({})), None);
            assert_eq!(extract_mqtt_port(&json!({ "port": 99999 })), None);
        }
    }

    mod device_rows {
        use super::*;
        use serde_json::json;

        fn logger() -> SmartLogger {
            SmartLogger::new("test")
        }

        #[test]
        fn mac_colons_are_stripped_from_the_id() {
            let rows = vec![json!({ "device_id": "7C:2C:67:AA:BB:CC" })];
            let devices = parse_device_rows(&rows, &logger());
            assert!(devices.contains_key("7C2C67AABBCC"));
        }

        #[test]
        fn rows_without_id_are_skipped() {
            let rows = vec![
                json!({ "device_name": "ghost" }),
                json!({ "device_id": "AA:BB", "device_name": "real" }),
            ];
            let devices = parse_device_rows(&rows, &logger());
            assert_eq!(devices.len(), 1);
            assert_eq!(devices["AABB"].name.as_deref(), Some("real"));
        }

        #[test]
        fn modbus_overrides_are_captured_from_product_info() {
            let rows = vec![json!({
                "device_id": "AA:BB",
                "productInfo": { "modbus_address": 1, "modbus_count": 120 }
            })];
            let devices = parse_device_rows(&rows, &logger());
            let device = &devices["AABB"];
            assert_eq!(device.modbus_address, Some(1));
            assert_eq!(device.modbus_count, Some(120));
        }

        #[test]
        fn missing_product_info_leaves_overrides_unset() {
            let rows = vec![json!({ "device_id": "AA:BB" })];
            let devices = parse_device_rows(&rows, &logger());
            let device = &devices["AABB"];
            assert_eq!(device.modbus_address, None);
            assert_eq!(device.modbus_count, None);
        }
    }

    mod identity {
        use super::*;

        #[test]
        fn device_id_is_stable_within_a_session() {
            let client = ApiClient::new().unwrap();
            let a = client.client_info();
            let b = client.client_info();
            assert_eq!(a["DEVICEID"], b["DEVICEID"]);
            assert_eq!(a["DEVICEID"].as_str().unwrap().len(), 32);
        }
    }
}
