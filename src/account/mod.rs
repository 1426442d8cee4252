//! 账户配置加载
//!
//! 从 TOML 的 `[[accounts]]` 列表中按名称取出账户，并根据 `[endpoint.<exchange>]`
//! 解析该账户实际使用的 REST/WS 地址 (测试网/正式网、各交易所的 WS 变体)。

use crate::adapter::ExchangeId;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Failed to read account config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse account config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown exchange '{0}'")]
    UnknownExchange(String),

    #[error("No endpoint section for exchange '{0}'")]
    MissingEndpoint(String),

    #[error("Endpoint '{field}' is not configured for exchange '{exchange}'")]
    MissingField { exchange: String, field: &'static str },
}

/// 已解析的账户
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub exchange: ExchangeId,
    pub sub_account: Option<String>,
    pub test_net: bool,
    pub api_key: String,
    pub api_secret: String,
    pub api_public: String,
    pub ws_public: String,
    pub api_auth: String,
    pub ws_auth: String,
    /// Huobi: MBR 行情; OKX: business 频道
    pub ws_add_on: Option<String>,
    pub passphrase: Option<String>,
    pub master_email: Option<String>,
    pub master_name: Option<String>,
    pub two_fa: Option<String>,
    pub ws_api: Option<String>,
}

impl Account {
    /// 子账户 (需要从主账户取 UID/account-id)
    pub fn has_master(&self) -> bool {
        self.master_name.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct AccountFile {
    #[serde(default)]
    accounts: Vec<AccountEntry>,
    #[serde(default)]
    endpoint: HashMap<String, EndpointEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AccountEntry {
    exchange: String,
    name: String,
    #[serde(default)]
    sub_account_name: Option<String>,
    #[serde(default)]
    test_net: bool,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    api_secret: String,
    #[serde(default)]
    passphrase: Option<String>,
    #[serde(default)]
    master_email: Option<String>,
    #[serde(default)]
    master_name: Option<String>,
    #[serde(default)]
    two_fa: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EndpointEntry {
    api_public: Option<String>,
    api_auth: Option<String>,
    api_test: Option<String>,
    ws_public: Option<String>,
    ws_test_public: Option<String>,
    ws_auth: Option<String>,
    ws_test: Option<String>,
    ws_api: Option<String>,
    ws_api_test: Option<String>,
    ws_public_mbr: Option<String>,
    ws_business: Option<String>,
}

fn required(value: &Option<String>, exchange: &str, field: &'static str) -> Result<String, AccountError> {
    value.clone().ok_or_else(|| AccountError::MissingField {
        exchange: exchange.to_string(),
        field,
    })
}

fn pick(test_net: bool, test: &Option<String>, prod: &Option<String>) -> Option<String> {
    if test_net {
        test.clone()
    } else {
        prod.clone()
    }
}

impl AccountEntry {
    fn resolve(&self, endpoints: &HashMap<String, EndpointEntry>) -> Result<Account, AccountError> {
        let exchange = ExchangeId::parse(&self.exchange)
            .ok_or_else(|| AccountError::UnknownExchange(self.exchange.clone()))?;
        let key = exchange.as_str();
        let ep = endpoints
            .get(&self.exchange)
            .or_else(|| endpoints.get(key))
            .ok_or_else(|| AccountError::MissingEndpoint(key.to_string()))?;
        let test_net = self.test_net;

        let api_public = required(&ep.api_public, key, "api_public")?;

        let api_auth = match exchange {
            ExchangeId::Bitfinex => required(&ep.api_auth, key, "api_auth")?,
            _ if test_net => required(&ep.api_test, key, "api_test")?,
            _ => required(&ep.api_auth, key, "api_auth")?,
        };

        let ws_public = match exchange {
            ExchangeId::Bybit if test_net => required(&ep.ws_test_public, key, "ws_test_public")?,
            _ => required(&ep.ws_public, key, "ws_public")?,
        };

        let ws_auth = match exchange {
            ExchangeId::Bitfinex => required(&ep.ws_auth, key, "ws_auth")?,
            _ if test_net => required(&ep.ws_test, key, "ws_test")?,
            _ => required(&ep.ws_auth, key, "ws_auth")?,
        };

        let ws_api = match exchange {
            ExchangeId::Bitfinex | ExchangeId::Okx => Some(ws_auth.clone()),
            _ => pick(test_net, &ep.ws_api_test, &ep.ws_api),
        };

        let ws_add_on = match exchange {
            ExchangeId::Huobi => ep.ws_public_mbr.clone(),
            ExchangeId::Okx => ep.ws_business.clone(),
            _ => None,
        };

        Ok(Account {
            name: self.name.clone(),
            exchange,
            sub_account: self.sub_account_name.clone(),
            test_net,
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            api_public,
            ws_public,
            api_auth,
            ws_auth,
            ws_add_on,
            passphrase: self.passphrase.clone(),
            master_email: self.master_email.clone(),
            master_name: self.master_name.clone(),
            two_fa: self.two_fa.clone(),
            ws_api,
        })
    }
}

/// 按名称读取账户，未配置时返回 `Ok(None)`
pub fn get_account<P: AsRef<Path>>(path: P, name: &str) -> Result<Option<Account>, AccountError> {
    let content = fs::read_to_string(path.as_ref())?;
    let file: AccountFile = toml::from_str(&content)?;
    file.accounts
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.resolve(&file.endpoint))
        .transpose()
}
