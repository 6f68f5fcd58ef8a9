//! Wire types for the HubSoft REST API.
//!
//! The upstream has at least one endpoint that spells its success marker
//! `"suscess"`; [`is_success`] accepts both spellings everywhere a status
//! field is matched.

use serde::{Deserialize, Serialize};

/// Upstream success check, tolerant of the historical typo.
pub fn is_success(status: Option<&str>) -> bool {
    matches!(status, Some("success") | Some("suscess"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClienteResponse {
    pub status: Option<String>,
    #[serde(default)]
    pub clientes: Vec<Cliente>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cliente {
    #[serde(default, alias = "nome")]
    pub nome_razaosocial: Option<String>,
    #[serde(default)]
    pub cpf_cnpj: Option<String>,
    #[serde(default)]
    pub telefone: Option<String>,
    #[serde(default)]
    pub celular: Option<String>,
    #[serde(default)]
    pub servicos: Vec<Servico>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Servico {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub nome: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub plano: Option<String>,
}

/// Client snapshot handed to the rest of the system: upstream fields
/// flattened to what verification, invites and ticket creation need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub phone: Option<String>,
    pub id_cliente_servico: Option<i64>,
    pub service_name: Option<String>,
    pub service_status: Option<String>,
    pub services: Vec<ServiceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub plan: Option<String>,
}

const GAMING_KEYWORDS: &[&str] = &["gaming", "gamer", "game"];

impl ClientInfo {
    pub fn from_cliente(cliente: Cliente) -> Self {
        let first = cliente.servicos.first();
        Self {
            name: cliente
                .nome_razaosocial
                .unwrap_or_else(|| "Cliente".to_string()),
            phone: cliente.telefone.or(cliente.celular),
            id_cliente_servico: first.and_then(|s| s.id),
            service_name: first.and_then(|s| s.nome.clone()),
            service_status: first.and_then(|s| s.status.clone()),
            services: cliente
                .servicos
                .into_iter()
                .map(|s| ServiceInfo {
                    id: s.id,
                    name: s.nome,
                    status: s.status,
                    plan: s.plano,
                })
                .collect(),
        }
    }

    /// The first service whose plan reads like a gaming product.
    pub fn gaming_plan(&self) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| {
            let plan = s.plan.as_deref().or(s.name.as_deref()).unwrap_or_default();
            let plan = plan.to_lowercase();
            GAMING_KEYWORDS.iter().any(|k| plan.contains(k))
        })
    }

    pub fn plan_name(&self) -> Option<String> {
        self.gaming_plan()
            .and_then(|s| s.plan.clone().or_else(|| s.name.clone()))
            .or_else(|| self.service_name.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateAtendimentoRequest {
    pub id_cliente_servico: i64,
    pub id_tipo_atendimento: i64,
    pub id_atendimento_status: i64,
    pub descricao: String,
    pub nome: String,
    pub telefone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AtendimentoCreateResponse {
    pub status: Option<String>,
    #[serde(default)]
    pub atendimento: Option<Atendimento>,
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atendimento {
    /// Creation responses use `id_atendimento`; list endpoints use `id`.
    #[serde(default)]
    pub id_atendimento: Option<i64>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub protocolo: Option<String>,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
    #[serde(default)]
    pub data_cadastro: Option<String>,
    #[serde(default)]
    pub titulo: Option<String>,
    #[serde(default)]
    pub descricao: Option<String>,
}

impl Atendimento {
    pub fn upstream_id(&self) -> Option<String> {
        self.id_atendimento.or(self.id).map(|id| id.to_string())
    }

    /// Status arrives either as a bare string or as `{"display": ...}`.
    pub fn status_name(&self) -> Option<String> {
        match &self.status {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Object(map)) => map
                .get("display")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            _ => None,
        }
    }

    pub fn full_description(&self) -> String {
        let mut text = String::new();
        if let Some(titulo) = &self.titulo {
            text.push_str(titulo);
            text.push(' ');
        }
        if let Some(descricao) = &self.descricao {
            text.push_str(descricao);
        }
        text
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientAtendimentosResponse {
    pub status: Option<String>,
    #[serde(default)]
    pub atendimentos: Vec<Atendimento>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginatedAtendimentos {
    pub status: Option<String>,
    #[serde(default)]
    pub atendimentos: Vec<Atendimento>,
    #[serde(default)]
    pub paginacao: Option<Paginacao>,
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paginacao {
    #[serde(default)]
    pub total_registros: Option<i64>,
    #[serde(default)]
    pub pagina_atual: Option<i64>,
    #[serde(default)]
    pub ultima_pagina: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimpleResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl SimpleResponse {
    pub fn ok(&self) -> bool {
        self.success.unwrap_or(false) || is_success(self.status.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_accepts_the_upstream_typo() {
        assert!(is_success(Some("success")));
        assert!(is_success(Some("suscess")));
        assert!(!is_success(Some("error")));
        assert!(!is_success(None));
    }

    #[test]
    fn client_info_flattens_first_service() {
        let cliente: Cliente = serde_json::from_value(serde_json::json!({
            "nome_razaosocial": "Alice",
            "cpf_cnpj": "11144477735",
            "servicos": [
                {"id": 77, "nome": "Fibra 500", "status": "servico_habilitado", "plano": "Gamer 500"}
            ]
        }))
        .unwrap();

        let info = ClientInfo::from_cliente(cliente);
        assert_eq!(info.name, "Alice");
        assert_eq!(info.id_cliente_servico, Some(77));
        assert_eq!(info.plan_name().as_deref(), Some("Gamer 500"));
        assert!(info.gaming_plan().is_some());
    }

    #[test]
    fn gaming_plan_detection_is_keyword_based() {
        let info = ClientInfo {
            name: "Bob".into(),
            phone: None,
            id_cliente_servico: Some(1),
            service_name: Some("Fibra 300".into()),
            service_status: Some("servico_habilitado".into()),
            services: vec![ServiceInfo {
                id: Some(1),
                name: Some("Fibra 300".into()),
                status: Some("servico_habilitado".into()),
                plan: Some("Residencial 300".into()),
            }],
        };
        assert!(info.gaming_plan().is_none());
        assert_eq!(info.plan_name().as_deref(), Some("Fibra 300"));
    }

    #[test]
    fn atendimento_status_supports_both_shapes() {
        let flat: Atendimento = serde_json::from_value(serde_json::json!({
            "id": 9, "status": "Aguardando Análise"
        }))
        .unwrap();
        assert_eq!(flat.status_name().as_deref(), Some("Aguardando Análise"));
        assert_eq!(flat.upstream_id().as_deref(), Some("9"));

        let nested: Atendimento = serde_json::from_value(serde_json::json!({
            "id_atendimento": 11, "status": {"display": "Em Andamento"}
        }))
        .unwrap();
        assert_eq!(nested.status_name().as_deref(), Some("Em Andamento"));
        assert_eq!(nested.upstream_id().as_deref(), Some("11"));
    }
}
