//! User-facing Portuguese messages.
//!
//! Every failure message names the next action and never carries stack
//! traces, full CPFs or tokens.

use sn_app::{CreateTicketOutcome, SubmitCpfOutcome, TicketView};
use sn_domain::VerificationType;

pub fn verification_request(verification_type: VerificationType) -> String {
    let (title, deadline) = match verification_type {
        VerificationType::SupportRequest => (
            "Verificação necessária para suporte",
            "Isso é necessário para continuar com seu atendimento.",
        ),
        VerificationType::AutoCheckup => (
            "Verificação de segurança necessária",
            "Você tem 24 horas para confirmar, caso contrário será removido do grupo.",
        ),
        VerificationType::InitialRegistration => (
            "Bem-vindo! Vamos confirmar seu cadastro",
            "Você tem 24 horas para concluir a confirmação.",
        ),
    };

    format!(
        "{title}\n\n\
         Por segurança, preciso que você confirme seu CPF.\n\n\
         Como proceder:\n\
         - Digite apenas os 11 números do seu CPF\n\
         - Exemplo: 12345678901\n\n\
         Prazo: {deadline}\n\n\
         Digite seu CPF agora:"
    )
}

pub fn submit_outcome(outcome: &SubmitCpfOutcome) -> String {
    match outcome {
        SubmitCpfOutcome::NoPendingVerification => {
            "Não há verificação pendente para você.\n\nUse /start para iniciar seu cadastro."
                .to_string()
        }
        SubmitCpfOutcome::InvalidFormat {
            attempts_left,
            exhausted,
        } => attempt_failure("CPF inválido. Verifique os 11 dígitos e os dígitos verificadores.", *attempts_left, *exhausted),
        SubmitCpfOutcome::NotFound {
            attempts_left,
            exhausted,
        } => attempt_failure(
            "CPF não encontrado em nossa base de clientes ativos.",
            *attempts_left,
            *exhausted,
        ),
        SubmitCpfOutcome::UpstreamUnavailable => {
            "Nosso sistema de cadastro está temporariamente indisponível.\n\n\
             Sua tentativa não foi descontada. Tente novamente em alguns minutos."
                .to_string()
        }
        SubmitCpfOutcome::Conflict {
            existing_username, ..
        } => format!(
            "Este CPF já está vinculado a outra conta ({}).\n\n\
             Se esta nova conta é sua, confirme a transferência com o botão abaixo. \
             A conta antiga perderá o acesso ao grupo.",
            existing_username.as_deref().unwrap_or("conta anterior")
        ),
        SubmitCpfOutcome::Completed { client, invite } => {
            let mut text = format!(
                "Verificação concluída com sucesso!\n\n\
                 Cliente: {}\n\
                 Plano: {}\n",
                client.name,
                client.plan_name().unwrap_or_else(|| "N/A".to_string()),
            );
            if let Some(invite) = invite {
                text.push_str(&format!(
                    "\nSeu convite de acesso (uso único, válido por {} minutos):\n{}\n",
                    (invite.expires_at - invite.created_at).num_minutes(),
                    invite.invite_url
                ));
            }
            text.push_str("\nObrigado por manter seus dados atualizados.");
            text
        }
    }
}

fn attempt_failure(reason: &str, attempts_left: u32, exhausted: bool) -> String {
    if exhausted {
        format!(
            "Verificação falhou: {reason}\n\n\
             Muitas tentativas falharam. Entre em contato com nosso suporte se precisar de ajuda."
        )
    } else {
        format!(
            "Verificação falhou: {reason}\n\n\
             Você ainda tem {attempts_left} tentativa(s). Digite seu CPF novamente (apenas números):"
        )
    }
}

pub fn expiration_notice(verification_type: VerificationType) -> String {
    match verification_type {
        VerificationType::AutoCheckup => "Verificação expirada — removido do grupo\n\n\
             Você foi removido do grupo por não confirmar seu CPF no prazo.\n\n\
             Para voltar: solicite um novo convite e use /start para registrar seu CPF."
            .to_string(),
        _ => "Verificação expirada\n\n\
             O prazo para confirmar seu CPF expirou.\n\n\
             Para usar o suporte, digite /suporte novamente e confirme seus dados."
            .to_string(),
    }
}

pub fn intake_welcome(client_name: &str, service_name: &str) -> String {
    format!(
        "Olá, {client_name}!\n\n\
         Vejo que você tem o plano {service_name}. Vamos resolver seu problema juntos?\n\n\
         Preciso de algumas informações para criar seu atendimento oficial. \
         Levará apenas 2-3 minutos e você terá um protocolo para acompanhar.\n\n\
         Qual o tipo do problema?"
    )
}

pub fn ask_game() -> &'static str {
    "Qual jogo está sendo mais afetado?"
}

pub fn ask_game_name() -> &'static str {
    "Digite o nome do jogo:"
}

pub fn ask_timing() -> &'static str {
    "Quando você começou a notar esse problema?"
}

pub fn ask_description() -> &'static str {
    "Agora, descreva o problema com suas palavras.\n\n\
     Pode incluir o que exatamente acontece, em que horários é pior e os \
     valores que você vê (ping, FPS).\n\n\
     Digite abaixo (entre 10 e 500 caracteres):"
}

pub fn description_too_short() -> &'static str {
    "Descrição muito curta.\n\n\
     Preciso de pelo menos 10 caracteres descrevendo o problema. \
     Digite uma descrição mais detalhada:"
}

pub fn ask_attachments() -> &'static str {
    "Se quiser, envie até 3 capturas de tela ou arquivos que ajudem no \
     diagnóstico. Quando terminar (ou se não tiver anexos), toque em Continuar."
}

pub fn confirmation_summary(
    client_name: &str,
    category: &str,
    game: &str,
    timing: &str,
    description: &str,
    attachment_count: usize,
) -> String {
    let preview: String = if description.chars().count() > 100 {
        format!("{}...", description.chars().take(97).collect::<String>())
    } else {
        description.to_string()
    };
    format!(
        "RESUMO DO SEU ATENDIMENTO:\n\n\
         Cliente: {client_name}\n\
         Problema: {category}\n\
         Jogo: {game}\n\
         Início: {timing}\n\
         Anexos: {attachment_count}\n\
         Detalhes: \"{preview}\"\n\n\
         Posso criar seu atendimento oficial agora?"
    )
}

pub fn ticket_outcome(outcome: &CreateTicketOutcome) -> String {
    match outcome {
        CreateTicketOutcome::Created {
            local_protocol,
            sync_deferred,
            ..
        } => {
            let mut text = format!(
                "ATENDIMENTO CRIADO COM SUCESSO!\n\n\
                 Protocolo: #{local_protocol}\n\n\
                 O que acontece agora:\n\
                 1. Nossa equipe técnica foi notificada\n\
                 2. Análise inicial em até 30 minutos\n\
                 3. Retorno com diagnóstico em até 4 horas\n\n\
                 Acompanhe pelo número do protocolo no tópico de suporte."
            );
            if *sync_deferred {
                text.push_str(
                    "\n\nObservação: seu protocolo oficial do sistema será \
                     confirmado assim que a sincronização concluir.",
                );
            }
            text
        }
        CreateTicketOutcome::ActiveTicketExists {
            local_protocol,
            category_label,
            status_name,
        } => format!(
            "Você já tem um atendimento em andamento.\n\n\
             Protocolo: #{local_protocol}\n\
             Categoria: {category_label}\n\
             Status: {status_name}\n\n\
             Aguarde o retorno da equipe ou mencione o protocolo no tópico de \
             suporte para adicionar informações."
        ),
        CreateTicketOutcome::NotVerified => {
            "Para usar o suporte, você precisa ser um cliente verificado.\n\n\
             Use o comando /start para validar seu CPF primeiro."
                .to_string()
        }
        CreateTicketOutcome::InvalidDescription { message } => format!(
            "Não consegui registrar o atendimento: {message}\n\nTente novamente com /suporte."
        ),
    }
}

pub fn intake_cancelled() -> &'static str {
    "Formulário cancelado.\n\nSem problemas! Se precisar de ajuda depois, é só usar /suporte novamente."
}

pub fn ticket_list(tickets: &[TicketView]) -> String {
    if tickets.is_empty() {
        return "Você ainda não tem atendimentos registrados.\n\nUse /suporte para abrir um."
            .to_string();
    }
    let mut text = String::from("Seus atendimentos:\n");
    for ticket in tickets {
        text.push_str(&format!(
            "\n#{} — {} ({})\n{} | aberto há {} dia(s)\n",
            ticket.protocol,
            ticket.category_label,
            ticket.game_label,
            ticket.status_name,
            ticket.days_open,
        ));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_never_leak_full_cpf() {
        // The outcome carries only masked data by construction; make sure
        // the templates do not interpolate anything CPF-shaped.
        let text = submit_outcome(&SubmitCpfOutcome::NotFound {
            attempts_left: 2,
            exhausted: false,
        });
        assert!(text.contains("2 tentativa(s)"));
        assert!(!text.contains("111444777"));
    }

    #[test]
    fn active_ticket_message_names_protocol_and_status() {
        let text = ticket_outcome(&CreateTicketOutcome::ActiveTicketExists {
            local_protocol: "LOC000001".into(),
            category_label: "Conectividade/Ping".into(),
            status_name: "Em Análise".into(),
        });
        assert!(text.contains("#LOC000001"));
        assert!(text.contains("Em Análise"));
    }

    #[test]
    fn summary_truncates_long_descriptions() {
        let text = confirmation_summary("Alice", "Conectividade", "Valorant", "Agora", &"x".repeat(200), 1);
        assert!(text.contains("..."));
    }
}
