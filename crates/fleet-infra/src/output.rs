//! Best-effort extraction of facts from the provisioning tool's console text.
//!
//! Every extractor is independent and total: a missing or garbled field
//! leaves that field empty and never disturbs the others.

use std::sync::LazyLock;

use regex::Regex;

use crate::discovery::usable_ipv4;
use crate::types::{DeploymentSummary, SshConnection};

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid regex")
});
static CONTROL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").expect("valid regex"));
static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n)+").expect("valid regex"));
static ADDED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) added").expect("valid regex"));
static BLOCK_HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*)$").expect("valid regex"));
static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]*)"|\b(\d+)\b"#).expect("valid regex"));
static IPV4_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("valid regex"));

/// Singular id outputs, tried in order when a single machine was requested.
const SINGULAR_ID_FIELDS: [&str; 4] = ["ct_id", "vm_id", "vmid", "container_id"];
const SINGULAR_IP_FIELDS: [&str; 2] = ["vm_ip_address", "ct_ip_address"];

/// Strip escape/control sequences, normalize line endings and collapse
/// runs of blank lines.
pub fn clean_output(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let text = raw.replace("\r\n", "\n").replace('\r', "\n");
    let text = ANSI_ESCAPE.replace_all(&text, "");
    let text = CONTROL.replace_all(&text, "");
    let text = BLANK_RUN.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Build the summary for a run that provisioned `machine_name`.
///
/// `single` enables the singular-field fallbacks used by one-machine
/// templates that do not emit the array outputs.
pub fn extract_summary(output: &str, machine_name: &str, single: bool) -> DeploymentSummary {
    let mut summary = DeploymentSummary::minimal(machine_name);
    summary.resources_created = resources_created(output);

    let blocks = output_blocks(output);
    let block = |name: &str| blocks.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());

    summary.vm_ids = block("vm_ids").map(id_tokens).unwrap_or_default();
    summary.vm_names = block("vm_names").map(string_tokens).unwrap_or_default();
    summary.vm_ips = block("vm_ip_addresses").map(string_tokens).unwrap_or_default();
    summary.vm_macs = block("vm_mac_addresses").map(string_tokens).unwrap_or_default();

    if single {
        if summary.vm_ids.is_empty()
            && let Some(id) = singular_id(output)
        {
            summary.vm_ids.push(id);
        }
        if summary.vm_names.is_empty() && !summary.vm_ids.is_empty() {
            summary.vm_names.push(machine_name.to_string());
        }
        if summary.vm_ips.is_empty()
            && let Some(ip) = singular_ip(output)
        {
            summary.vm_ips.push(ip);
        }
    }

    if let Some(ssh) = block("vm_ssh_connections") {
        summary.ssh_connections = ssh_connections(ssh, &summary.vm_names, &summary.vm_ips);
    }

    summary
}

/// Human-readable success message listing every machine.
pub fn format_success_message(summary: &DeploymentSummary) -> String {
    let mut lines = vec!["Successfully created machines:".to_string()];

    for (i, name) in summary.vm_names.iter().enumerate() {
        let id = summary
            .vm_ids
            .get(i)
            .map(|id| id.to_string())
            .unwrap_or_else(|| "N/A".into());
        match summary.vm_ips.get(i) {
            Some(ip) => lines.push(format!("   {name} (ID: {id}, IP: {ip})")),
            None => lines.push(format!("   {name} (ID: {id})")),
        }
    }

    if summary.vm_names.is_empty() {
        lines.push(format!("   {}", summary.machine_name));
    }
    if summary.resources_created > 0 {
        lines.push(format!("Resources created: {}", summary.resources_created));
    }

    lines.join("\n")
}

/// Count from the `Resources: N added, ...` line; the last one wins.
fn resources_created(output: &str) -> u32 {
    output
        .lines()
        .filter(|line| line.contains("Resources:"))
        .filter_map(|line| ADDED.captures(line))
        .filter_map(|c| c[1].parse().ok())
        .last()
        .unwrap_or(0)
}

/// The text after the final `Outputs:` header, or the whole output when the
/// header is missing.
fn outputs_section(output: &str) -> &str {
    let mut offset = 0;
    let mut section_start = None;
    for line in output.split_inclusive('\n') {
        offset += line.len();
        if line.trim() == "Outputs:" {
            section_start = Some(offset);
        }
    }
    section_start.map_or(output, |start| &output[start..])
}

/// `(name, text)` for every top-level `name = ...` line, with indented
/// continuation lines appended to the block they follow.
fn output_blocks(output: &str) -> Vec<(String, String)> {
    let mut blocks: Vec<(String, String)> = Vec::new();

    for line in outputs_section(output).lines() {
        let indented = line.starts_with([' ', '\t']);
        if !indented && let Some(c) = BLOCK_HEAD.captures(line) {
            blocks.push((c[1].to_string(), c[2].to_string()));
            continue;
        }
        if let Some((_, text)) = blocks.last_mut() {
            text.push('\n');
            text.push_str(line);
        }
    }

    blocks
}

/// Body of the first bracketed list, or the whole block for scalars.
fn list_body(block: &str) -> &str {
    match (block.find('['), block.rfind(']')) {
        (Some(open), Some(close)) if close > open => &block[open + 1..close],
        (Some(open), None) => &block[open + 1..],
        _ => block,
    }
}

fn id_tokens(block: &str) -> Vec<u32> {
    TOKEN
        .captures_iter(list_body(block))
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .filter_map(|m| m.as_str().trim().parse().ok())
        .collect()
}

fn string_tokens(block: &str) -> Vec<String> {
    TOKEN
        .captures_iter(list_body(block))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn singular_id(output: &str) -> Option<u32> {
    SINGULAR_ID_FIELDS.iter().find_map(|field| {
        let re = Regex::new(&format!(r#"\b{field}\s*=\s*"?(\d+)"#)).ok()?;
        re.captures(output).and_then(|c| c[1].parse().ok())
    })
}

fn singular_ip(output: &str) -> Option<String> {
    let named = SINGULAR_IP_FIELDS.iter().find_map(|field| {
        let re = Regex::new(&format!(r#"\b{field}\s*=\s*"([^"]+)""#)).ok()?;
        let raw = re.captures(output)?.get(1)?.as_str();
        usable_ipv4(raw).map(|ip| ip.to_string())
    });

    named.or_else(|| {
        IPV4_LITERAL
            .find_iter(outputs_section(output))
            .find_map(|m| usable_ipv4(m.as_str()))
            .map(|ip| ip.to_string())
    })
}

fn ssh_connections(block: &str, names: &[String], ips: &[String]) -> Vec<SshConnection> {
    let commands: Vec<String> = string_tokens(block)
        .into_iter()
        .filter(|t| t.starts_with("ssh "))
        .collect();

    names
        .iter()
        .enumerate()
        .filter_map(|(i, name)| {
            let command = match commands.get(i) {
                Some(cmd) => cmd.clone(),
                None if !commands.is_empty() => return None,
                None => match ips.get(i).map(String::as_str) {
                    Some(ip) if ip != "dhcp" && !ip.is_empty() => format!("ssh user@{ip}"),
                    _ => "ssh user@<IP>".to_string(),
                },
            };
            Some(SshConnection {
                name: name.clone(),
                command,
            })
        })
        .collect()
}
