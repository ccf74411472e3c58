//! Container config generation.
//!
//! `generate` is a pure function from the typed view of a sandbox to the
//! config blob the runtime backend consumes: a NixOS container expression in
//! `extra-container` form. No I/O happens here; the creator writes the bytes
//! to `sandboxes_dir/<name>.nix` and hands the path to the backend. Callers
//! treat the output as opaque.

use crate::allocator;
use crate::contrib::Contributions;
use crate::mux::Multiplexer;
use crate::template::ResourceLimits;

#[derive(Debug, Clone)]
pub struct ContainerConfig<'a> {
    pub name: &'a str,
    pub container_name: &'a str,
    pub network_slot: u8,
    pub authorized_keys: &'a [String],
    pub uid: u32,
    pub gid: u32,
    pub mux: Multiplexer,
    pub runtime_id: &'a str,
    pub username: &'a str,
    pub workspace_dir: &'a str,
    pub state_version: &'a str,
    pub resource_limits: Option<ResourceLimits>,
    pub contributions: &'a Contributions,
}

/// Escape a string for interpolation into a double-quoted Nix string.
fn nix_str(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '$' if chars.peek() == Some(&'{') => escaped.push_str("\\${"),
            c => escaped.push(c),
        }
    }
    escaped.push('"');
    escaped
}

pub fn generate(config: &ContainerConfig<'_>) -> Vec<u8> {
    let mut out = String::new();
    let container = config.container_name;
    let username = config.username;

    out.push_str("{ pkgs, lib, ... }:\n{\n");
    out.push_str(&format!("  containers.{container} = {{\n"));
    out.push_str("    autoStart = false;\n");
    out.push_str("    ephemeral = true;\n");
    out.push_str("    privateNetwork = true;\n");
    out.push_str(&format!(
        "    hostAddress = {};\n",
        nix_str(&allocator::host_ip(config.network_slot))
    ));
    out.push_str(&format!(
        "    localAddress = {};\n",
        nix_str(&allocator::container_ip(config.network_slot))
    ));

    out.push_str("    bindMounts = {\n");
    for mount in &config.contributions.mounts {
        out.push_str(&format!(
            "      {} = {{ hostPath = {}; isReadOnly = {}; }};\n",
            nix_str(&mount.container_path.display().to_string()),
            nix_str(&mount.host_path.display().to_string()),
            mount.read_only
        ));
    }
    out.push_str("    };\n");

    out.push_str("    config = { ... }: {\n");
    out.push_str(&format!(
        "      system.stateVersion = {};\n",
        nix_str(config.state_version)
    ));

    out.push_str(&format!("      users.users.{username} = {{\n"));
    out.push_str("        isNormalUser = true;\n");
    out.push_str(&format!("        uid = {};\n", config.uid));
    out.push_str(&format!("        group = {};\n", nix_str(username)));
    out.push_str(&format!(
        "        home = {};\n",
        nix_str(&format!("/home/{username}"))
    ));
    out.push_str("        openssh.authorizedKeys.keys = [\n");
    for key in config.authorized_keys {
        out.push_str(&format!("          {}\n", nix_str(key)));
    }
    out.push_str("        ];\n");
    out.push_str("      };\n");
    out.push_str(&format!(
        "      users.groups.{username}.gid = {};\n",
        config.gid
    ));

    out.push_str("      services.openssh.enable = true;\n");
    out.push_str("      services.openssh.settings.PasswordAuthentication = false;\n");

    out.push_str("      environment.systemPackages = with pkgs; [\n");
    for package in &config.contributions.packages {
        out.push_str(&format!("        {}\n", package.name));
    }
    out.push_str("      ];\n");

    if !config.contributions.env_vars.is_empty() {
        out.push_str("      environment.variables = {\n");
        for (name, value) in &config.contributions.env_vars {
            out.push_str(&format!("        {} = {};\n", nix_str(name), nix_str(value)));
        }
        out.push_str("      };\n");
    }

    if !config.contributions.tmpfiles_rules.is_empty() {
        out.push_str("      systemd.tmpfiles.rules = [\n");
        for rule in &config.contributions.tmpfiles_rules {
            out.push_str(&format!("        {}\n", nix_str(rule)));
        }
        out.push_str("      ];\n");
    }

    if let Some(limits) = &config.resource_limits {
        if let Some(cpus) = limits.cpus {
            out.push_str(&format!(
                "      systemd.services.\"container@{container}\".serviceConfig.CPUQuota = {};\n",
                nix_str(&format!("{}%", cpus * 100))
            ));
        }
        if let Some(memory_mb) = limits.memory_mb {
            out.push_str(&format!(
                "      systemd.services.\"container@{container}\".serviceConfig.MemoryMax = {};\n",
                nix_str(&format!("{memory_mb}M"))
            ));
        }
    }

    out.push_str("    };\n");
    out.push_str("  };\n");
    out.push_str("}\n");
    out.into_bytes()
}
