//! Message templates.
//!
//! Every message has a subject, an HTML body and a plain-text body. All
//! case and owner text is HTML-escaped before it reaches markup.

use vetdispatch_db::Case;
use vetdispatch_ids::CaseId;
use vetdispatch_protocol::ActionKind;

/// A rendered message, before it is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

#[derive(Debug, Clone)]
pub struct MessageTemplates {
    base_url: String,
}

impl MessageTemplates {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    /// `GET` link a candidate clicks to accept or decline.
    pub fn respond_link(&self, case_id: &CaseId, token: &str, action: ActionKind) -> String {
        format!(
            "{}/cases/{}/respond?token={}&action={}",
            self.base_url,
            case_id,
            token,
            action.as_query_value()
        )
    }

    pub fn follow_up_link(&self, case_id: &CaseId) -> String {
        format!("{}/cases/{}/follow-up", self.base_url, case_id)
    }

    /// The broadcast message with accept and decline links.
    pub fn new_case(
        &self,
        case: &Case,
        vet_name: &str,
        accept_token: &str,
        decline_token: &str,
    ) -> RenderedMessage {
        let accept = self.respond_link(&case.id, accept_token, ActionKind::Accept);
        let decline = self.respond_link(&case.id, decline_token, ActionKind::Decline);
        let subject = if case.is_emergency {
            format!("URGENT: {} case in {}", case.species, case.city)
        } else {
            format!("New {} case in {}", case.species, case.city)
        };

        let banner = if case.is_emergency {
            "<p style=\"color:#b00020;font-weight:bold\">Emergency: the owner needs help as soon as possible.</p>\n"
        } else {
            ""
        };

        let html_body = format!(
            "<p>Dear {name},</p>\n{banner}<p>A new case needs a vet.</p>\n{summary}\
             <p>The first vet to accept gets the case.</p>\n\
             <p><a href=\"{accept}\">Accept this case</a> &middot; <a href=\"{decline}\">Decline</a></p>\n",
            name = escape_html(vet_name),
            banner = banner,
            summary = case_summary_html(case),
            accept = escape_html(&accept),
            decline = escape_html(&decline),
        );

        let text_body = format!(
            "Dear {name},\n\n{urgent}A new case needs a vet.\n\n{summary}\n\
             The first vet to accept gets the case.\n\nAccept: {accept}\nDecline: {decline}\n",
            name = vet_name,
            urgent = if case.is_emergency { "EMERGENCY. " } else { "" },
            summary = case_summary_text(case),
            accept = accept,
            decline = decline,
        );

        RenderedMessage {
            subject,
            html_body,
            text_body,
        }
    }

    /// Full-detail message for the winner, including the owner's contact details.
    pub fn acceptance_confirmation(&self, case: &Case, vet_name: &str) -> RenderedMessage {
        let follow_up = self.follow_up_link(&case.id);
        let address = case.address.as_deref().unwrap_or("not provided");
        let phone = case.owner_phone.as_deref().unwrap_or("not provided");
        let email = case.owner_email.as_deref().unwrap_or("not provided");

        let html_body = format!(
            "<p>Dear {name},</p>\n<p>The case is yours. Please contact the owner.</p>\n{summary}\
             <h3>Owner</h3>\n<ul>\n<li>Name: {owner}</li>\n<li>Phone: {phone}</li>\n\
             <li>Email: {email}</li>\n<li>Address: {address}, {location}</li>\n</ul>\n\
             <p>After the visit, please fill in the <a href=\"{follow_up}\">follow-up form</a>.</p>\n",
            name = escape_html(vet_name),
            summary = case_summary_html(case),
            owner = escape_html(&case.owner_name),
            phone = escape_html(phone),
            email = escape_html(email),
            address = escape_html(address),
            location = escape_html(&case.location_label()),
            follow_up = escape_html(&follow_up),
        );

        let text_body = format!(
            "Dear {name},\n\nThe case is yours. Please contact the owner.\n\n{summary}\n\
             Owner: {owner}\nPhone: {phone}\nEmail: {email}\nAddress: {address}, {location}\n\n\
             Follow-up form: {follow_up}\n",
            name = vet_name,
            summary = case_summary_text(case),
            owner = case.owner_name,
            phone = phone,
            email = email,
            address = address,
            location = case.location_label(),
            follow_up = follow_up,
        );

        RenderedMessage {
            subject: format!("Case assigned to you: {} in {}", case.species, case.city),
            html_body,
            text_body,
        }
    }

    /// Terse notice to everyone who lost the race.
    pub fn case_taken(&self, case: &Case, vet_name: &str) -> RenderedMessage {
        RenderedMessage {
            subject: format!("Case taken: {} in {}", case.species, case.city),
            html_body: format!(
                "<p>Dear {},</p>\n<p>The {} case in {} has been accepted by another vet. \
                 No action is needed.</p>\n",
                escape_html(vet_name),
                escape_html(&case.species),
                escape_html(&case.city),
            ),
            text_body: format!(
                "Dear {},\n\nThe {} case in {} has been accepted by another vet. No action is needed.\n",
                vet_name, case.species, case.city
            ),
        }
    }

    /// Owner notice after a claim.
    pub fn owner_assigned(&self, case: &Case, vet_name: &str) -> RenderedMessage {
        RenderedMessage {
            subject: "A vet has accepted your case".to_string(),
            html_body: format!(
                "<p>Dear {},</p>\n<p>{} accepted your {} case and will contact you shortly.</p>\n",
                escape_html(&case.owner_name),
                escape_html(vet_name),
                escape_html(&case.species),
            ),
            text_body: format!(
                "Dear {},\n\n{} accepted your {} case and will contact you shortly.\n",
                case.owner_name, vet_name, case.species
            ),
        }
    }

    /// Owner notice after the case expired without an accept.
    pub fn owner_expired(&self, case: &Case) -> RenderedMessage {
        RenderedMessage {
            subject: "No vet was available for your case".to_string(),
            html_body: format!(
                "<p>Dear {},</p>\n<p>We could not find an available vet for your {} case in {}. \
                 Please submit a new request or call your nearest clinic.</p>\n",
                escape_html(&case.owner_name),
                escape_html(&case.species),
                escape_html(&case.city),
            ),
            text_body: format!(
                "Dear {},\n\nWe could not find an available vet for your {} case in {}. \
                 Please submit a new request or call your nearest clinic.\n",
                case.owner_name, case.species, case.city
            ),
        }
    }
}

fn case_summary_html(case: &Case) -> String {
    format!(
        "<ul>\n<li>Species: {}</li>\n<li>Location: {}</li>\n<li>Consultation: {}</li>\n\
         <li>Issue: {}</li>\n</ul>\n",
        escape_html(&case.species),
        escape_html(&case.location_label()),
        case.consultation_kind.label(),
        escape_html(&case.issue),
    )
}

fn case_summary_text(case: &Case) -> String {
    format!(
        "Species: {}\nLocation: {}\nConsultation: {}\nIssue: {}\n",
        case.species,
        case.location_label(),
        case.consultation_kind.label(),
        case.issue
    )
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vetdispatch_protocol::{CaseStatus, ConsultationKind};

    fn case(emergency: bool) -> Case {
        Case {
            id: CaseId::new(),
            city: "Lahore".into(),
            state: Some("Punjab".into()),
            address: Some("12 Canal Road".into()),
            species: "Cow".into(),
            issue: "Swollen <left> leg & fever".into(),
            is_emergency: emergency,
            consultation_kind: ConsultationKind::Subsidized,
            owner_name: "Ayesha".into(),
            owner_email: Some("ayesha@example.com".into()),
            owner_phone: Some("+92 300".into()),
            status: CaseStatus::Open,
            assigned_candidate_id: None,
            created_at: Utc::now(),
            expires_at: Utc::now(),
            closed_at: None,
            dispatched_at: None,
            dispatch_attempts: 0,
            last_dispatch_error: None,
            escalation_round: 0,
            escalated_at: None,
        }
    }

    #[test]
    fn test_new_case_links_and_escaping() {
        let templates = MessageTemplates::new("https://dispatch.example/");
        let case = case(false);
        let msg = templates.new_case(&case, "Dr. O'Neil", "tokA", "tokD");

        let accept = format!(
            "https://dispatch.example/cases/{}/respond?token=tokA&action=accept",
            case.id
        );
        assert!(msg.text_body.contains(&accept));
        assert!(msg.html_body.contains(&escape_html(&accept)));
        assert!(msg.text_body.contains("action=decline"));
        assert!(msg.html_body.contains("Swollen &lt;left&gt; leg &amp; fever"));
        assert!(msg.html_body.contains("Dr. O&#39;Neil"));
        assert!(msg.html_body.contains("Subsidized visit"));
        assert_eq!(msg.subject, "New Cow case in Lahore");
        assert!(!msg.text_body.contains("12 Canal Road"));
    }

    #[test]
    fn test_emergency_banner() {
        let templates = MessageTemplates::new("http://localhost");
        let msg = templates.new_case(&case(true), "Dr. A", "a", "d");
        assert!(msg.subject.starts_with("URGENT"));
        assert!(msg.html_body.contains("Emergency"));
    }

    #[test]
    fn test_confirmation_reveals_owner_details() {
        let templates = MessageTemplates::new("http://localhost");
        let case = case(false);
        let msg = templates.acceptance_confirmation(&case, "Dr. A");
        assert!(msg.text_body.contains("+92 300"));
        assert!(msg.text_body.contains("12 Canal Road, Lahore, Punjab"));
        assert!(msg
            .text_body
            .contains(&format!("http://localhost/cases/{}/follow-up", case.id)));
    }

    #[test]
    fn test_case_taken_is_terse() {
        let templates = MessageTemplates::new("http://localhost");
        let msg = templates.case_taken(&case(false), "Dr. B");
        assert!(!msg.text_body.contains("Ayesha"));
        assert!(!msg.text_body.contains("respond?token"));
    }
}
