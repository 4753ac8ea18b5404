//! Proxy configuration rendering.
//!
//! Rendering is a pure function of the service list: identical input
//! always yields byte-identical output, which keeps diffs of the rendered
//! file meaningful.

use std::fmt::Write;
use std::net::IpAddr;

use log::warn;

use crate::discovery::Service;
use crate::error::{EmitError, EmitResult};

pub trait Renderer: Send + Sync {
    fn render(&self, services: &[Service]) -> EmitResult<String>;
}

/// Renders one `upstream` and one `server` block per service, plus a
/// default server answering 503 for unknown hosts.
#[derive(Debug, Clone, Default)]
pub struct NginxRenderer;

const HEADER: &str = "# Generated by fleetconf. Manual edits are overwritten on the next reconfiguration.\n";

impl Renderer for NginxRenderer {
    fn render(&self, services: &[Service]) -> EmitResult<String> {
        let mut out = String::from(HEADER);
        for service in services {
            let mut block = String::new();
            match render_service(&mut block, service) {
                Ok(()) => out.push_str(&block),
                Err(e) => warn!("Skipping service {}: {}", service.name, e),
            }
        }
        out.push_str(
            "\nserver {\n    listen 80 default_server;\n    server_name _;\n    return 503;\n}\n",
        );
        Ok(out)
    }
}

fn render_service(out: &mut String, service: &Service) -> EmitResult<()> {
    let upstream = upstream_name(service);
    let host = service.host().unwrap_or(&service.name);
    let port = service.port();
    let body_size = service.client_max_body_size();

    let names: Vec<&str> = host
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() {
        check_token("VIRTUAL_HOST", host)?;
    }
    for name in &names {
        check_token("VIRTUAL_HOST", name)?;
    }
    check_token("VIRTUAL_PORT", port)?;
    if port.parse::<u16>().is_err() {
        return Err(EmitError::Render(format!(
            "service {}: invalid VIRTUAL_PORT {:?}",
            service.name, port
        )));
    }
    check_token("NGINX_CLIENT_MAX_BODY_SIZE", body_size)?;

    // Writing to a String cannot fail.
    let _ = writeln!(out, "\nupstream {} {{", upstream);
    for address in service.addresses() {
        let address = match address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
            Ok(IpAddr::V4(v4)) => v4.to_string(),
            Err(_) => {
                return Err(EmitError::Render(format!(
                    "service {}: invalid container address {:?}",
                    service.name, address
                )))
            }
        };
        let _ = writeln!(out, "    server {}:{};", address, port);
    }
    out.push_str("}\n\n");

    out.push_str("server {\n    listen 80;\n");
    let _ = writeln!(out, "    server_name {};", names.join(" "));
    let _ = writeln!(out, "    client_max_body_size {};", body_size);
    if service.force_ssl() {
        out.push_str(
            "\n    if ($http_x_forwarded_proto != \"https\") {\n        return 301 https://$host$request_uri;\n    }\n",
        );
    }
    out.push_str("\n    location / {\n");
    let _ = writeln!(out, "        proxy_pass http://{};", upstream);
    out.push_str(concat!(
        "        proxy_http_version 1.1;\n",
        "        proxy_set_header Host $host;\n",
        "        proxy_set_header X-Real-IP $remote_addr;\n",
        "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n",
        "        proxy_set_header X-Forwarded-Proto $scheme;\n",
        "    }\n}\n",
    ));
    Ok(())
}

/// Upstream identifiers must be unique and free of nginx syntax.
fn upstream_name(service: &Service) -> String {
    let name: String = service
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let id: String = service.id.chars().take(8).collect();
    format!("{}-{}", name, id)
}

/// Container-supplied values end up verbatim in the config.
fn check_token(key: &str, value: &str) -> EmitResult<()> {
    if value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"' | '\'' | '#' | '$'))
    {
        return Err(EmitError::Render(format!("invalid {} value {:?}", key, value)));
    }
    Ok(())
}
