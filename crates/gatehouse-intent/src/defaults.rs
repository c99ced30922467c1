//! Built-in rule and route packs.
//!
//! Used when `config/rules.toml` or `config/routes.toml` is absent.  Both are
//! plain TOML in the same shape as the on-disk files, so they double as
//! documentation of the format.

use gatehouse_kernel::{RuleFile, RuleSpec};

use crate::error::Result;
use crate::semantic::{RouteFile, SemanticRoute};

pub const DEFAULT_RULES_TOML: &str = r#"
[[rule]]
id = "INC-001"
name = "ETL or batch pipeline failure"
pattern = '\b(etl|pipeline|batch job|nightly job)\b.*\b(fail(ed|ing|ure)?|broken|stuck|missing|error)\b'
intent = "incident"
sub_intent = "etl_failure"
workflow = "magentic"
priority = 90
confidence = 0.92
tags = ["data", "ops"]

[[rule]]
id = "INC-002"
name = "security incident"
keywords = ["phishing", "malware", "ransomware", "data breach", "compromised account"]
intent = "incident"
sub_intent = "security_incident"
workflow = "handoff"
priority = 95
confidence = 0.9
tags = ["security"]

[[rule]]
id = "INC-003"
name = "service outage"
pattern = '\b(outage|is down|went down|not responding|unreachable|503)\b'
intent = "incident"
sub_intent = "service_outage"
workflow = "concurrent"
priority = 85
confidence = 0.85
tags = ["ops"]

[[rule]]
id = "REQ-001"
name = "password reset"
pattern = '\b(reset|forgot|change|unlock)\b.*\bpassword\b'
intent = "request"
sub_intent = "password_reset"
workflow = "simple"
priority = 80
confidence = 0.95
tags = ["identity"]

[[rule]]
id = "REQ-002"
name = "access request"
pattern = '\b(need|request|grant|give me)\b.*\b(access|permission|permissions)\b'
intent = "request"
sub_intent = "access_request"
workflow = "sequential"
priority = 70
confidence = 0.88
tags = ["identity"]

[[rule]]
id = "REQ-003"
name = "software installation"
pattern = '\b(install|license for|licence for)\b'
intent = "request"
sub_intent = "software_install"
workflow = "sequential"
priority = 60
confidence = 0.85

[[rule]]
id = "CHG-001"
name = "deployment"
pattern = '\b(deploy|roll ?out|release)\b.*\b(to|into)\b.*\b(prod|production|staging)\b'
intent = "change"
sub_intent = "deployment"
workflow = "sequential"
priority = 75
confidence = 0.9
tags = ["release"]

[[rule]]
id = "CHG-002"
name = "infrastructure configuration change"
pattern = '\b(change|update|modify|open)\b.*\b(firewall|dns|config|configuration|port)\b'
intent = "change"
sub_intent = "config_change"
workflow = "group_chat"
priority = 65
confidence = 0.85
tags = ["infra"]

[[rule]]
id = "QRY-001"
name = "status question"
pattern = '^\s*(what|when|where|who|is|are|how many)\b.*\?\s*$'
intent = "query"
sub_intent = "status_inquiry"
workflow = "simple"
priority = 10
confidence = 0.7
"#;

pub const DEFAULT_ROUTES_TOML: &str = r#"
[[route]]
name = "account_lockout"
description = "Users who cannot sign in"
intent = "request"
sub_intent = "account_unlock"
workflow = "simple"
utterances = [
    "I am locked out of my account",
    "my account is locked",
    "cannot log in anymore",
    "sign in keeps failing",
]

[[route]]
name = "vpn_connectivity"
description = "Remote access connectivity problems"
intent = "incident"
sub_intent = "vpn_issue"
workflow = "simple"
utterances = [
    "vpn keeps disconnecting",
    "cannot connect to the vpn",
    "remote access is not working",
]

[[route]]
name = "data_pipeline"
description = "Late or missing data from scheduled jobs"
intent = "incident"
sub_intent = "etl_failure"
workflow = "magentic"
utterances = [
    "the dashboard has no data since yesterday",
    "report numbers did not refresh overnight",
    "warehouse tables are stale",
]

[[route]]
name = "hardware_request"
description = "New or replacement equipment"
intent = "request"
sub_intent = "hardware_request"
workflow = "sequential"
utterances = [
    "I need a new laptop",
    "my monitor is broken and needs replacing",
    "can I get a second screen",
]

[[route]]
name = "capacity_change"
description = "Scaling infrastructure up or down"
intent = "change"
sub_intent = "capacity_change"
workflow = "group_chat"
utterances = [
    "scale the cluster to ten nodes",
    "increase memory on the database server",
    "add more workers to the queue consumers",
]

[[route]]
name = "ticket_status"
description = "Questions about existing tickets"
intent = "query"
sub_intent = "ticket_status"
workflow = "simple"
utterances = [
    "what is the status of my ticket",
    "has anyone looked at my request yet",
]
"#;

pub fn default_rules() -> Result<Vec<RuleSpec>> {
    Ok(RuleFile::from_toml_str(DEFAULT_RULES_TOML)?.rule)
}

pub fn default_routes() -> Result<Vec<SemanticRoute>> {
    Ok(RouteFile::from_toml_str(DEFAULT_ROUTES_TOML)?.route)
}
