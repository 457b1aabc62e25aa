//! The Unix-domain command socket: wire framing (§6) and command dispatch
//! (§4.7).

use std::fmt;

pub use enforcerd_api::{read_frame, write_exit, write_frame, Frame, Opcode};

use crate::center::{self, Center};
use crate::domain::{DsAtParent, KeyRole};
use crate::scheduler::{TaskKind, TaskTarget};

//----------- Command grammar ----------------------------------------------------------

/// One parsed command line: `<verb> [<sub-verb>] [--opt value ...]`. Most
/// commands are two words (`zone add`, `key ds-seen`); `help` is one.
pub struct ParsedCommand {
    pub verb: String,
    pub sub: Option<String>,
    pub opts: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct SyntaxError(pub String);

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syntax error: {}", self.0)
    }
}

pub fn parse_line(line: &str) -> Result<ParsedCommand, SyntaxError> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().ok_or_else(|| SyntaxError("empty command".into()))?.to_string();

    let mut next = parts.next();
    let sub = match next {
        Some(tok) if !tok.starts_with("--") => {
            let sub = tok.to_string();
            next = parts.next();
            Some(sub)
        }
        _ => None,
    };

    let mut opts = Vec::new();
    while let Some(tok) = next {
        let Some(name) = tok.strip_prefix("--") else {
            return Err(SyntaxError(format!("expected an option starting with '--', found '{tok}'")));
        };
        let value = parts
            .next()
            .ok_or_else(|| SyntaxError(format!("option '--{name}' expects a value")))?;
        opts.push((name.to_string(), value.to_string()));
        next = parts.next();
    }
    Ok(ParsedCommand { verb, sub, opts })
}

impl ParsedCommand {
    fn get(&self, name: &str) -> Option<&str> {
        self.opts.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

//----------- Dispatch -------------------------------------------------------------------

pub struct CommandOutcome {
    pub status: u8,
    pub stdout: String,
    pub stderr: String,
}

fn ok(stdout: impl Into<String>) -> CommandOutcome {
    CommandOutcome { status: 0, stdout: stdout.into(), stderr: String::new() }
}

fn fail(stderr: impl Into<String>) -> CommandOutcome {
    CommandOutcome { status: 1, stdout: String::new(), stderr: stderr.into() }
}

fn syntax_error(stderr: impl Into<String>) -> CommandOutcome {
    CommandOutcome { status: 2, stdout: String::new(), stderr: stderr.into() }
}

/// Run one command line to completion against `center`, per §4.7: each
/// command opens its own transaction, performs its mutation, and enqueues
/// whatever downstream task follows from it.
pub fn dispatch(center: &Center, line: &str) -> CommandOutcome {
    let parsed = match parse_line(line) {
        Ok(p) => p,
        Err(err) => return syntax_error(err.to_string()),
    };

    tracing::debug!("received command '{}'", parsed.verb);

    match parsed.verb.as_str() {
        "help" => ok(HELP_TEXT),
        "zone" => dispatch_zone(center, &parsed),
        "key" => dispatch_key(center, &parsed),
        "policy" => dispatch_policy(center, &parsed),
        other => syntax_error(format!("unknown command '{other}'")),
    }
}

const HELP_TEXT: &str = "\
zone add --name NAME --policy POLICY
zone delete --name NAME
key ds-submit --zone NAME (--keytag TAG | --locator LOC)
key ds-seen --zone NAME (--keytag TAG | --locator LOC)
key ds-retract --zone NAME (--keytag TAG | --locator LOC)
key ds-gone --zone NAME (--keytag TAG | --locator LOC)
key rollover --zone NAME --role {ksk|zsk|csk}
policy import
policy resalt --name NAME
";

fn dispatch_zone(center: &Center, cmd: &ParsedCommand) -> CommandOutcome {
    match cmd.sub.as_deref() {
        Some("add") => {
            let (Some(name), Some(policy)) = (cmd.get("name"), cmd.get("policy")) else {
                return syntax_error("'zone add' requires --name and --policy");
            };
            match center::add_zone(center, name, policy) {
                Ok(_) => ok(format!("added zone '{name}'\n")),
                Err(err) => fail(err.to_string()),
            }
        }
        Some("delete") => {
            let Some(name) = cmd.get("name") else {
                return syntax_error("'zone delete' requires --name");
            };
            match center::remove_zone(center, name) {
                Ok(()) => ok(format!("removed zone '{name}'\n")),
                Err(err) => fail(err.to_string()),
            }
        }
        _ => syntax_error("expected 'zone add' or 'zone delete'"),
    }
}

fn dispatch_key(center: &Center, cmd: &ParsedCommand) -> CommandOutcome {
    match cmd.sub.as_deref() {
        Some(verb @ ("ds-submit" | "ds-seen" | "ds-retract" | "ds-gone")) => ds_transition(center, cmd, verb),
        Some("rollover") => rollover(center, cmd),
        _ => syntax_error("expected 'key ds-submit', 'key ds-seen', 'key ds-retract', 'key ds-gone' or 'key rollover'"),
    }
}

fn ds_transition(center: &Center, cmd: &ParsedCommand, verb: &str) -> CommandOutcome {
    let Some(zone_name) = cmd.get("zone") else {
        return syntax_error("requires --zone");
    };
    let keytag = cmd.get("keytag").map(|s| s.parse::<u16>());
    let locator = cmd.get("locator");
    let keytag = match (keytag, locator) {
        (Some(Ok(tag)), None) => Some(tag),
        (None, Some(_)) => None,
        _ => return syntax_error("exactly one of --keytag or --locator must be supplied"),
    };

    let mut txn = match center.db.transaction() {
        Ok(txn) => txn,
        Err(err) => return fail(err.to_string()),
    };
    let Some(zone) = txn.get_zone_by_name(zone_name) else {
        return fail(format!("no zone named '{zone_name}'"));
    };
    let zone_id = zone.id;

    let key_id = txn
        .list_keys(zone_id)
        .find(|k| {
            k.role == KeyRole::Ksk || k.role == KeyRole::Csk
        })
        .filter(|k| keytag.is_none_or(|tag| k.keytag == tag))
        .filter(|k| locator.is_none_or(|loc| txn.get_hsm_key(k.hsm_key).is_some_and(|h| &*h.locator == loc)))
        .map(|k| k.id);

    let Some(key_id) = key_id else {
        return fail("no matching KSK/CSK found for this zone");
    };

    let Some(key) = txn.get_key_mut(key_id) else {
        return fail("key vanished");
    };

    let (from, to) = match verb {
        "ds-submit" => (DsAtParent::Submit, DsAtParent::Submitted),
        "ds-seen" => (DsAtParent::Submitted, DsAtParent::Seen),
        "ds-retract" => (DsAtParent::Retract, DsAtParent::Retracted),
        "ds-gone" => (DsAtParent::Retracted, DsAtParent::Unsubmitted),
        _ => unreachable!(),
    };

    if key.ds_at_parent != from {
        return fail(format!(
            "key {} is in DS-at-parent state {:?}, expected {:?}",
            key.keytag, key.ds_at_parent, from
        ));
    }
    key.ds_at_parent = to;
    txn.commit();

    center.scheduler.enqueue(TaskKind::Enforce, TaskTarget::Zone(zone_id), center.scheduler.clock.now());
    ok(format!("DS-at-parent for key {} now {:?}\n", key_id.0, to))
}

fn rollover(center: &Center, cmd: &ParsedCommand) -> CommandOutcome {
    let (Some(zone_name), Some(role)) = (cmd.get("zone"), cmd.get("role")) else {
        return syntax_error("'key rollover' requires --zone and --role");
    };
    let role = match role {
        "ksk" => KeyRole::Ksk,
        "zsk" => KeyRole::Zsk,
        "csk" => KeyRole::Csk,
        other => return syntax_error(format!("unknown role '{other}'")),
    };

    let mut txn = match center.db.transaction() {
        Ok(txn) => txn,
        Err(err) => return fail(err.to_string()),
    };
    let Some(zone) = txn.get_zone_by_name(zone_name) else {
        return fail(format!("no zone named '{zone_name}'"));
    };
    let zone_id = zone.id;
    let Some(zone) = txn.get_zone_mut(zone_id) else {
        return fail("zone vanished");
    };
    match role {
        KeyRole::Ksk => zone.roll_ksk_now = true,
        KeyRole::Zsk => zone.roll_zsk_now = true,
        KeyRole::Csk => zone.roll_csk_now = true,
    }
    zone.next_change = None;
    txn.commit();

    center.scheduler.enqueue(TaskKind::Enforce, TaskTarget::Zone(zone_id), center.scheduler.clock.now());
    ok(format!("rollover of {role} requested for zone '{zone_name}'\n"))
}

fn dispatch_policy(center: &Center, cmd: &ParsedCommand) -> CommandOutcome {
    match cmd.sub.as_deref() {
        Some("import") => match center::reload_policies(center) {
            Ok(()) => ok("policies reloaded\n"),
            Err(err) => fail(err.to_string()),
        },
        Some("resalt") => {
            let Some(name) = cmd.get("name") else {
                return syntax_error("'policy resalt' requires --name");
            };
            let mut policies = center.policies.lock().unwrap();
            let Some(policy) = policies.get_mut(name) else {
                return fail(format!("no policy named '{name}'"));
            };
            policy.nsec3_salt_last_change = Some(crate::domain::UnixTime(0));
            drop(policies);
            center.scheduler.enqueue(TaskKind::Resalt, TaskTarget::Policy(name.into()), center.scheduler.clock.now());
            ok(format!("resalt of policy '{name}' requested\n"))
        }
        _ => syntax_error("expected 'policy import' or 'policy resalt'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_command_line() {
        let parsed = parse_line("zone add --name example. --policy default").unwrap();
        assert_eq!(parsed.verb, "zone");
        assert_eq!(parsed.sub.as_deref(), Some("add"));
        assert_eq!(parsed.get("name"), Some("example."));
        assert_eq!(parsed.get("policy"), Some("default"));
    }

    #[test]
    fn rejects_a_dangling_option() {
        assert!(parse_line("zone add --name").is_err());
    }

    #[test]
    fn unknown_verb_is_a_syntax_error() {
        let center = test_center();
        let outcome = dispatch(&center, "frobnicate something");
        assert_eq!(outcome.status, 2);
    }

    fn test_center() -> Center {
        use crate::policy::file::Spec;
        let config = crate::config::Config::default();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let logger: &'static crate::log::Logger = Box::leak(Box::new(crate::log::Logger::for_tests()));
        let center = Center::new(config, logger, tx);
        center.policies.lock().unwrap().insert("default".into(), crate::policy::Policy::new(Spec::default().parse("default")));
        center
    }

    #[test]
    fn zone_add_then_delete_round_trips() {
        let center = test_center();
        let added = dispatch(&center, "zone add --name example. --policy default");
        assert_eq!(added.status, 0);
        let removed = dispatch(&center, "zone delete --name example.");
        assert_eq!(removed.status, 0);
    }

    /// S2: the enforcer parks a freshly-rumoured KSK's DS in `Submit`
    /// (please submit this); an operator must acknowledge the submission
    /// before `ds-seen` (the parent publishes it) is legal.
    #[test]
    fn ds_seen_requires_an_acknowledged_submission_first() {
        let center = test_center();
        dispatch(&center, "zone add --name example. --policy default");

        let mut txn = center.db.transaction().unwrap();
        let zone_id = txn.get_zone_by_name("example.").unwrap().id;
        let hsm = txn.insert_hsm_key(crate::domain::HsmKey {
            id: crate::domain::HsmKeyId(0),
            locator: "loc".into(),
            bits: 2048,
            algorithm: 8,
            repository: "default".into(),
            policy: "default".into(),
            role: KeyRole::Ksk,
            inception: Some(crate::domain::UnixTime::now()),
            candidate_for_sharing: false,
            revoke: false,
            backed_up: false,
            used_by_zones: vec![zone_id],
        });
        let mut key = crate::keys::factory::new_key(zone_id, hsm, KeyRole::Ksk, 8, crate::domain::UnixTime::now());
        key.keytag = 12345;
        key.ds_at_parent = DsAtParent::Submit;
        txn.insert_key(key);
        txn.commit();

        let too_soon = dispatch(&center, "key ds-seen --zone example. --keytag 12345");
        assert_eq!(too_soon.status, 1);

        let submitted = dispatch(&center, "key ds-submit --zone example. --keytag 12345");
        assert_eq!(submitted.status, 0);

        let seen = dispatch(&center, "key ds-seen --zone example. --keytag 12345");
        assert_eq!(seen.status, 0);

        let txn = center.db.transaction().unwrap();
        let key = txn.list_keys(zone_id).find(|k| k.keytag == 12345).unwrap();
        assert_eq!(key.ds_at_parent, DsAtParent::Seen);
    }
}
