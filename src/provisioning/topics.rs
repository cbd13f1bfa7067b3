//! Fleet-provisioning topic layout.
//!
//! ```text
//! $aws/certificates/create-from-csr/{fmt}[/accepted|/rejected]
//! $aws/provisioning-templates/{template}/provision/{fmt}[/accepted|/rejected]
//! ```

use serde::Deserialize;
use std::fmt;

const CSR_PREFIX: &str = "$aws/certificates/create-from-csr";
const TEMPLATE_PREFIX: &str = "$aws/provisioning-templates";
const PROVISION_SEGMENT: &str = "provision";

/// Maximum template name length accepted by the service.
pub const MAX_TEMPLATE_NAME_LEN: usize = 36;

/// Payload serialization selected by the topic suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Cbor,
    Json,
}

impl PayloadFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cbor => "cbor",
            Self::Json => "json",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cbor" => Some(Self::Cbor),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    CreateCertificateFromCsr,
    RegisterThing,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateCertificateFromCsr => "CreateCertificateFromCsr",
            Self::RegisterThing => "RegisterThing",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    Rejected,
}

/// A topic recognised as a provisioning response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicMatch<'a> {
    pub step: StepKind,
    pub format: PayloadFormat,
    pub disposition: Disposition,
    pub template: Option<&'a str>,
}

/// Request topic plus the two response topics of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub publish: String,
    pub accepted: String,
    pub rejected: String,
}

impl TopicSet {
    pub fn create_certificate_from_csr(format: PayloadFormat) -> Self {
        Self::with_base(format!("{CSR_PREFIX}/{}", format.as_str()))
    }

    pub fn register_thing(template: &str, format: PayloadFormat) -> Self {
        Self::with_base(format!(
            "{TEMPLATE_PREFIX}/{template}/{PROVISION_SEGMENT}/{}",
            format.as_str()
        ))
    }

    fn with_base(base: String) -> Self {
        Self {
            accepted: format!("{base}/accepted"),
            rejected: format!("{base}/rejected"),
            publish: base,
        }
    }

    pub fn response_filters(&self) -> [String; 2] {
        [self.accepted.clone(), self.rejected.clone()]
    }

    pub fn disposition_of(&self, topic: &str) -> Option<Disposition> {
        if topic == self.accepted {
            Some(Disposition::Accepted)
        } else if topic == self.rejected {
            Some(Disposition::Rejected)
        } else {
            None
        }
    }
}

/// Recognise any provisioning response topic, whatever step or template it names.
pub fn match_topic(topic: &str) -> Option<TopicMatch<'_>> {
    let (base, last) = topic.rsplit_once('/')?;
    let disposition = match last {
        "accepted" => Disposition::Accepted,
        "rejected" => Disposition::Rejected,
        _ => return None,
    };
    let (base, fmt) = base.rsplit_once('/')?;
    let format = PayloadFormat::parse(fmt)?;

    if base == CSR_PREFIX {
        return Some(TopicMatch {
            step: StepKind::CreateCertificateFromCsr,
            format,
            disposition,
            template: None,
        });
    }

    let rest = base.strip_prefix(TEMPLATE_PREFIX)?.strip_prefix('/')?;
    let template = rest.strip_suffix(PROVISION_SEGMENT)?.strip_suffix('/')?;
    if template.is_empty() || template.contains('/') {
        return None;
    }
    Some(TopicMatch {
        step: StepKind::RegisterThing,
        format,
        disposition,
        template: Some(template),
    })
}

/// Template names become a topic level, so wildcards and separators are refused.
pub fn validate_template_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("template name is empty".into());
    }
    if name.len() > MAX_TEMPLATE_NAME_LEN {
        return Err(format!(
            "template name exceeds {MAX_TEMPLATE_NAME_LEN} characters"
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_')))
    {
        return Err(format!("template name contains invalid character {c:?}"));
    }
    Ok(())
}
