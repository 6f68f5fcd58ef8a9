//! Thin typed client over the HubSoft REST API.
//!
//! Every call goes through the process-wide token cache and an outbound
//! token-bucket limiter. A 401 invalidates the cached token and the request
//! is retried once with a fresh one; deadline and transport failures map to
//! [`HubSoftError`] kinds the engine knows how to classify.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::Deserialize;
use tracing::{debug, info, warn};

use sn_config::HubSoftConfig;
use sn_domain::Cpf;

use crate::error::HubSoftError;
use crate::token::TokenManager;
use crate::types::{
    is_success, Atendimento, AtendimentoCreateResponse, ClientAtendimentosResponse, Cliente,
    ClienteResponse, ClientInfo, CreateAtendimentoRequest, PaginatedAtendimentos, SimpleResponse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Bulk status refresh never walks more than this many pages.
pub const MAX_STATUS_PAGES: u32 = 10;
pub const STATUS_PAGE_SIZE: u32 = 100;

/// Some installations answer the client search with a bare array instead of
/// the documented envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum ClienteLookup {
    Wrapped(ClienteResponse),
    Bare(Vec<Cliente>),
}

#[derive(Debug, Clone)]
pub struct CreatedTicket {
    pub hubsoft_id: String,
    pub protocol: Option<String>,
    pub status: Option<String>,
    pub data_cadastro: Option<String>,
    pub raw: serde_json::Value,
}

pub struct HubSoftClient {
    http: reqwest::Client,
    config: HubSoftConfig,
    token: TokenManager,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl HubSoftClient {
    pub fn new(config: HubSoftConfig) -> Result<Self, HubSoftError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(HubSoftError::from_reqwest)?;

        let rate = NonZeroU32::new(config.rate_limit_per_sec).unwrap_or(nonzero!(10u32));
        let limiter = RateLimiter::direct(Quota::per_second(rate));
        let token = TokenManager::new(http.clone(), config.clone());

        Ok(Self {
            http,
            config,
            token,
            limiter,
        })
    }

    pub fn config(&self) -> &HubSoftConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.host.trim_end_matches('/'), endpoint)
    }

    /// Sends an authorized request, retrying exactly once on 401 with a
    /// fresh token.
    async fn authorized<F>(&self, build: F) -> Result<reqwest::Response, HubSoftError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        self.limiter.until_ready().await;

        let token = self.token.access_token().await?;
        let response = build(&self.http, &token)
            .send()
            .await
            .map_err(HubSoftError::from_reqwest)?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.token.invalidate().await;
            let token = self.token.access_token().await?;
            let response = build(&self.http, &token)
                .send()
                .await
                .map_err(HubSoftError::from_reqwest)?;
            return Self::check(response).await;
        }

        Self::check(response).await
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, HubSoftError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            warn!(retry_after_secs, "HubSoft rate limit hit");
            return Err(HubSoftError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();
        Err(HubSoftError::from_status(status.as_u16(), body))
    }

    /// Looks up an enabled-service client by CPF. `None` means the CPF is
    /// unknown upstream or has no enabled service.
    pub async fn verify_client_by_cpf(
        &self,
        cpf: &Cpf,
        _include_contracts: bool,
    ) -> Result<Option<ClientInfo>, HubSoftError> {
        let url = self.url(&self.config.endpoints.cliente);
        debug!(cpf = %cpf.masked(), "Verifying client upstream");

        let response = self
            .authorized(|http, token| {
                http.get(&url).bearer_auth(token).query(&[
                    ("busca", "cpf_cnpj"),
                    ("termo_busca", cpf.as_str()),
                    ("servico_status", "servico_habilitado"),
                    ("limit", "1"),
                ])
            })
            .await?;

        let lookup: ClienteLookup = response
            .json()
            .await
            .map_err(|e| HubSoftError::Schema(format!("client lookup: {e}")))?;

        let clientes = match lookup {
            ClienteLookup::Wrapped(wrapped) => wrapped.clientes,
            ClienteLookup::Bare(list) => list,
        };

        Ok(clientes.into_iter().next().map(ClientInfo::from_cliente))
    }

    pub async fn create_ticket(
        &self,
        request: &CreateAtendimentoRequest,
    ) -> Result<CreatedTicket, HubSoftError> {
        let url = self.url(&self.config.endpoints.atendimento);
        info!(cliente_servico = request.id_cliente_servico, "Creating atendimento upstream");

        let response = self
            .authorized(|http, token| http.post(&url).bearer_auth(token).json(request))
            .await?;

        let parsed: AtendimentoCreateResponse = response
            .json()
            .await
            .map_err(|e| HubSoftError::Schema(format!("create atendimento: {e}")))?;

        if !is_success(parsed.status.as_deref()) {
            return Err(HubSoftError::Schema(format!(
                "atendimento creation rejected: {}",
                parsed.msg.unwrap_or_default()
            )));
        }

        let atendimento = parsed
            .atendimento
            .ok_or_else(|| HubSoftError::Schema("response without atendimento".into()))?;
        let hubsoft_id = atendimento
            .upstream_id()
            .ok_or_else(|| HubSoftError::Schema("atendimento without id".into()))?;

        let raw = serde_json::to_value(&atendimento)
            .map_err(|e| HubSoftError::Schema(e.to_string()))?;

        info!(hubsoft_id = %hubsoft_id, protocol = ?atendimento.protocolo, "Atendimento created");
        Ok(CreatedTicket {
            hubsoft_id,
            protocol: atendimento.protocolo.clone(),
            status: atendimento.status_name(),
            data_cadastro: atendimento.data_cadastro.clone(),
            raw,
        })
    }

    /// Appends a note to an existing atendimento. Returns whether the
    /// upstream acknowledged it.
    pub async fn add_message_to_atendimento(
        &self,
        hubsoft_id: &str,
        message: &str,
    ) -> Result<bool, HubSoftError> {
        let url = format!(
            "{}/{hubsoft_id}",
            self.url(&self.config.endpoints.atendimento_mensagem)
        );
        let body = serde_json::json!({ "mensagem": message });

        let response = self
            .authorized(|http, token| http.post(&url).bearer_auth(token).json(&body))
            .await?;

        let parsed: SimpleResponse = response
            .json()
            .await
            .map_err(|e| HubSoftError::Schema(format!("add message: {e}")))?;
        Ok(parsed.ok())
    }

    /// Uploads one attachment as the multipart field `files[0]`.
    pub async fn add_attachment_to_atendimento(
        &self,
        hubsoft_id: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<bool, HubSoftError> {
        let url = format!(
            "{}/{hubsoft_id}",
            self.url(&self.config.endpoints.atendimento_anexo)
        );
        let filename = filename.to_string();

        let response = self
            .authorized(move |http, token| {
                let part = reqwest::multipart::Part::bytes(content.clone())
                    .file_name(filename.clone());
                let form = reqwest::multipart::Form::new().part("files[0]", part);
                http.post(&url).bearer_auth(token).multipart(form)
            })
            .await?;

        let parsed: SimpleResponse = response
            .json()
            .await
            .map_err(|e| HubSoftError::Schema(format!("add attachment: {e}")))?;
        Ok(parsed.ok())
    }

    /// The upstream exposes no field-level update; a status change is
    /// recorded as a note on the atendimento.
    pub async fn update_ticket_status(
        &self,
        hubsoft_id: &str,
        status_note: &str,
    ) -> Result<bool, HubSoftError> {
        self.add_message_to_atendimento(hubsoft_id, status_note).await
    }

    pub async fn search_tickets_by_cpf(
        &self,
        cpf: &Cpf,
        apenas_pendente: bool,
        tipo_atendimento: Option<i64>,
    ) -> Result<Vec<Atendimento>, HubSoftError> {
        let url = self.url(&self.config.endpoints.cliente_atendimento);
        let pendente = if apenas_pendente { "sim" } else { "nao" };

        let response = self
            .authorized(|http, token| {
                let mut request = http.get(&url).bearer_auth(token).query(&[
                    ("busca", "cpf_cnpj"),
                    ("termo_busca", cpf.as_str()),
                    ("apenas_pendente", pendente),
                    ("limit", "20"),
                ]);
                if let Some(tipo) = tipo_atendimento {
                    request = request.query(&[("tipo_atendimento", tipo.to_string())]);
                }
                request
            })
            .await?;

        let parsed: ClientAtendimentosResponse = response
            .json()
            .await
            .map_err(|e| HubSoftError::Schema(format!("client atendimentos: {e}")))?;

        if !is_success(parsed.status.as_deref()) {
            return Ok(Vec::new());
        }
        Ok(parsed.atendimentos)
    }

    pub async fn list_atendimentos_paginated(
        &self,
        pagina: u32,
        itens_por_pagina: u32,
        data_inicio: Option<&str>,
        data_fim: Option<&str>,
        relacoes: Option<&str>,
    ) -> Result<PaginatedAtendimentos, HubSoftError> {
        let url = self.url(&self.config.endpoints.atendimento_todos);

        let response = self
            .authorized(|http, token| {
                let mut request = http.get(&url).bearer_auth(token).query(&[
                    ("pagina", pagina.to_string()),
                    ("itens_por_pagina", itens_por_pagina.to_string()),
                ]);
                if let Some(inicio) = data_inicio {
                    request = request.query(&[("data_inicio", inicio)]);
                }
                if let Some(fim) = data_fim {
                    request = request.query(&[("data_fim", fim)]);
                }
                if let Some(rel) = relacoes {
                    request = request.query(&[("relacoes", rel)]);
                }
                request
            })
            .await?;

        response
            .json()
            .await
            .map_err(|e| HubSoftError::Schema(format!("paginated atendimentos: {e}")))
    }

    /// Finds one atendimento by upstream id, walking the paginated listing.
    pub async fn get_ticket_status(
        &self,
        hubsoft_id: &str,
    ) -> Result<Option<Atendimento>, HubSoftError> {
        for pagina in 0..MAX_STATUS_PAGES {
            let page = self
                .list_atendimentos_paginated(pagina, STATUS_PAGE_SIZE, None, None, None)
                .await?;
            if !is_success(page.status.as_deref()) || page.atendimentos.is_empty() {
                return Ok(None);
            }
            if let Some(found) = page
                .atendimentos
                .into_iter()
                .find(|a| a.upstream_id().as_deref() == Some(hubsoft_id))
            {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// A cheap probe: one item from the paginated listing.
    pub async fn check_api_health(&self) -> bool {
        match self.list_atendimentos_paginated(0, 1, None, None, None).await {
            Ok(page) => is_success(page.status.as_deref()),
            Err(e) => {
                debug!(error = %e, "HubSoft health probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> HubSoftClient {
        let mut config = HubSoftConfig::default();
        config.host = server.uri();
        config.client_id = "cid".into();
        config.client_secret = "secret".into();
        config.user = "u".into();
        config.password = "p".into();
        config.enabled = true;
        config.rate_limit_per_sec = 1000;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600
            })))
            .mount(server)
            .await;

        HubSoftClient::new(config).unwrap()
    }

    fn cpf() -> Cpf {
        Cpf::parse("11144477735").unwrap()
    }

    #[tokio::test]
    async fn verify_client_parses_envelope() {
        let server = MockServer::start().await;
        let client = client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/integracao/cliente"))
            .and(query_param("busca", "cpf_cnpj"))
            .and(query_param("termo_busca", "11144477735"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "clientes": [{
                    "nome_razaosocial": "Alice",
                    "cpf_cnpj": "11144477735",
                    "servicos": [{"id": 77, "nome": "Gamer 500", "status": "servico_habilitado", "plano": "Gamer 500"}]
                }]
            })))
            .mount(&server)
            .await;

        let info = client.verify_client_by_cpf(&cpf(), true).await.unwrap().unwrap();
        assert_eq!(info.name, "Alice");
        assert_eq!(info.id_cliente_servico, Some(77));
    }

    #[tokio::test]
    async fn verify_client_absent_is_none() {
        let server = MockServer::start().await;
        let client = client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/integracao/cliente"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "clientes": []
            })))
            .mount(&server)
            .await;

        assert!(client.verify_client_by_cpf(&cpf(), true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_accepts_misspelled_success() {
        let server = MockServer::start().await;
        let client = client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/integracao/cliente/atendimento"))
            .and(query_param("apenas_pendente", "sim"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "suscess",
                "atendimentos": [{"id": 42, "protocolo": "P42", "status": "Aguardando Análise"}]
            })))
            .mount(&server)
            .await;

        let tickets = client.search_tickets_by_cpf(&cpf(), true, None).await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].upstream_id().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn unauthorized_response_retries_with_fresh_token() {
        let server = MockServer::start().await;
        let client = client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/integracao/cliente"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/integracao/cliente"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "clientes": []
            })))
            .mount(&server)
            .await;

        assert!(client.verify_client_by_cpf(&cpf(), false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limit_maps_to_retry_after() {
        let server = MockServer::start().await;
        let client = client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/integracao/cliente"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let err = client.verify_client_by_cpf(&cpf(), false).await.unwrap_err();
        assert!(matches!(err, HubSoftError::RateLimited { retry_after_secs: 30 }));
    }

    #[tokio::test]
    async fn create_ticket_returns_upstream_identifiers() {
        let server = MockServer::start().await;
        let client = client(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/v1/integracao/atendimento"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "atendimento": {
                    "id_atendimento": 987,
                    "protocolo": "2024080198765",
                    "status": "Aguardando Análise",
                    "data_cadastro": "2024-08-01 10:00:00"
                }
            })))
            .mount(&server)
            .await;

        let created = client
            .create_ticket(&CreateAtendimentoRequest {
                id_cliente_servico: 77,
                id_tipo_atendimento: 101,
                id_atendimento_status: 1,
                descricao: "Ping alto em Valorant".into(),
                nome: "Alice".into(),
                telefone: "11999990000".into(),
            })
            .await
            .unwrap();

        assert_eq!(created.hubsoft_id, "987");
        assert_eq!(created.protocol.as_deref(), Some("2024080198765"));
    }

    #[tokio::test]
    async fn server_error_is_retryable_kind() {
        let server = MockServer::start().await;
        let client = client(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/v1/integracao/atendimento"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client
            .create_ticket(&CreateAtendimentoRequest {
                id_cliente_servico: 77,
                id_tipo_atendimento: 101,
                id_atendimento_status: 1,
                descricao: "x".into(),
                nome: "n".into(),
                telefone: "t".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn health_probe_checks_listing() {
        let server = MockServer::start().await;
        let client = client(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/integracao/atendimento/todos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "atendimentos": [],
                "paginacao": {"total_registros": 0}
            })))
            .mount(&server)
            .await;

        assert!(client.check_api_health().await);
    }
}
