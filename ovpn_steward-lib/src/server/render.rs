//! Everything the daemon reads at spawn time: the main config file, the
//! concatenated CA bundle, the verification scripts and the DH parameters.

use cidr::Ipv4Inet;

use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use crate::orgs::{AUTH_LOG_NAME, INDEX_NAME, ORGS_DIR, SERVER_USER_PREFIX, USERS_DIR, UserKind};

use super::templates;
use super::{Error, Server};

/// The host openssl toolchain is not reentrant; every invocation in this
/// process goes through one lock.
static OPENSSL_LOCK: Mutex<()> = Mutex::new(());

/// Split a CIDR into its address and dotted netmask, e.g.
/// `10.0.0.0/24` -> `("10.0.0.0", "255.255.255.0")`.
pub fn parse_network(network: &str) -> Result<(String, String), Error> {
    let inet: Ipv4Inet = network
        .parse()
        .map_err(|_| Error::InvalidNetwork(network.to_string()))?;
    let netmask = mask_from_length(inet.network_length());
    Ok((inet.address().to_string(), netmask.to_string()))
}

fn mask_from_length(length: u8) -> Ipv4Addr {
    if length == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << (32 - u32::from(length)))
    }
}

/// One `push "route addr mask"` line per local network, or the
/// default-gateway push when none are configured. No trailing newline.
pub fn push_directives(local_networks: &[String]) -> Result<String, Error> {
    if local_networks.is_empty() {
        return Ok("push \"redirect-gateway\"".to_string());
    }
    let mut lines = Vec::with_capacity(local_networks.len());
    for network in local_networks {
        let (address, netmask) = parse_network(network)?;
        lines.push(format!("push \"route {address} {netmask}\""));
    }
    Ok(lines.join("\n"))
}

/// Expensive; generated once per server at creation and again only if the
/// file has been removed.
pub(crate) fn generate_dh_param(path: &Path, bits: u16) -> Result<(), Error> {
    let _guard = OPENSSL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let output = Command::new("openssl")
        .arg("dhparam")
        .arg("-out")
        .arg(path)
        .arg(bits.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::HostCommand {
            command: "openssl dhparam".to_string(),
            status: output.status.code().unwrap_or_default(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Contents of a certificate file reduced to its PEM block.
fn pem_block(path: &Path) -> Result<String, Error> {
    let content = fs::read_to_string(path)?;
    let block = match content.find("-----BEGIN") {
        Some(index) => &content[index..],
        None => content.as_str(),
    };
    Ok(block.trim().to_string())
}

fn write_executable(path: &Path, content: &str) -> Result<(), Error> {
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

impl Server {
    /// Render the daemon config and its whole support surface. `inline`
    /// selects the variant carrying PEM blocks instead of file references.
    pub(crate) fn render_ovpn_conf(&mut self, inline: bool) -> Result<(), Error> {
        let orgs = self.attached_orgs()?;
        if orgs.is_empty() {
            return Err(Error::NoOrganizations);
        }
        tracing::debug!(server_id = %self.record.id, "rendering daemon config");

        if self.record.primary_organization.is_none() || self.record.primary_user.is_none() {
            self.create_primary_user(&orgs)?;
        }
        if !self.paths.dh_param().is_file() {
            generate_dh_param(&self.paths.dh_param(), self.ctx.inner.settings.dh_param_bits)?;
        }

        let primary_org = self
            .record
            .primary_organization
            .clone()
            .ok_or(Error::MissingPrimaryUser)?;
        let primary_user_id = self
            .record
            .primary_user
            .clone()
            .ok_or(Error::MissingPrimaryUser)?;
        let primary_user = self.ctx.inner.orgs
            .user(&primary_org, &primary_user_id)?
            .ok_or(Error::MissingPrimaryUser)?;

        fs::create_dir_all(self.paths.temp())?;
        self.write_ca_bundle()?;
        self.write_verify_scripts()?;

        let (address, netmask) = parse_network(&self.record.network)?;
        let server_line = format!("{address} {netmask}");
        let push = push_directives(&self.record.local_networks)?;
        let (verb, mute) = if self.record.debug { (4, 8) } else { (1, 3) };

        let ca_path = self.paths.ca_bundle();
        let tls_verify_path = self.paths.tls_verify();
        let dh_param_path = self.paths.dh_param();
        let ifc_pool_path = self.paths.ifc_pool();
        let status_path = self.paths.status_file();
        let context = templates::ConfContext {
            port: self.record.port,
            protocol: self.record.protocol,
            interface: &self.record.interface,
            ca_path: &ca_path,
            cert_path: &primary_user.cert_path,
            key_path: &primary_user.key_path,
            tls_verify_path: &tls_verify_path,
            dh_param_path: &dh_param_path,
            server_line: &server_line,
            ifc_pool_path: &ifc_pool_path,
            push: &push,
            status_path: &status_path,
            verb,
            mute,
        };
        let mut conf = if inline {
            templates::inline_server_conf(&context)
        } else {
            templates::server_conf(&context)
        };

        if self.record.otp_auth {
            conf.push_str(&format!(
                "auth-user-pass-verify {} via-file\n",
                self.paths.user_pass_verify().display()
            ));
        }
        if self.record.lzo_compression {
            conf.push_str("comp-lzo\npush \"comp-lzo\"\n");
        }
        if !self.record.local_networks.is_empty() {
            conf.push_str("client-to-client\n");
        }
        if inline {
            conf.push_str(&format!(
                "<ca>\n{}\n</ca>\n",
                pem_block(&self.paths.ca_bundle())?
            ));
            conf.push_str(&format!(
                "<cert>\n{}\n</cert>\n",
                pem_block(&primary_user.cert_path)?
            ));
            conf.push_str(&format!(
                "<key>\n{}\n</key>\n",
                fs::read_to_string(&primary_user.key_path)?.trim()
            ));
            conf.push_str(&format!(
                "<dh>\n{}\n</dh>\n",
                fs::read_to_string(self.paths.dh_param())?.trim()
            ));
        }

        fs::write(self.paths.ovpn_conf(), conf)?;
        Ok(())
    }

    /// Concatenate the CA certificate of every attached organization, in
    /// membership order.
    fn write_ca_bundle(&self) -> Result<(), Error> {
        let mut bundle = String::new();
        for org_id in &self.record.organizations {
            let ca_path = self.ctx.inner.orgs.ca_cert_path(org_id);
            bundle.push_str(&fs::read_to_string(&ca_path)?);
        }
        fs::write(self.paths.ca_bundle(), bundle)?;
        Ok(())
    }

    fn write_verify_scripts(&self) -> Result<(), Error> {
        let orgs_path = self.ctx.inner.settings.data_path.join(ORGS_DIR);
        let auth_log_path = self.ctx.inner.settings.data_path.join(AUTH_LOG_NAME);
        write_executable(
            &self.paths.tls_verify(),
            &templates::tls_verify_script(&orgs_path, INDEX_NAME, &auth_log_path),
        )?;
        write_executable(
            &self.paths.user_pass_verify(),
            &templates::user_pass_verify_script(
                &orgs_path,
                USERS_DIR,
                &self.paths.temp(),
                &auth_log_path,
            ),
        )?;
        Ok(())
    }

    /// Mint the server's own identity certificate in the first attached
    /// organization. If the subsequent commit fails the fresh user is
    /// removed again, best effort.
    fn create_primary_user(&mut self, orgs: &[String]) -> Result<(), Error> {
        let org_id = orgs.first().ok_or(Error::NoOrganizations)?.clone();
        tracing::debug!(server_id = %self.record.id, %org_id, "creating primary user");
        let user = self.ctx.inner.orgs.new_user(
            &org_id,
            UserKind::Server,
            &format!("{SERVER_USER_PREFIX}{}", self.record.id),
        )?;
        self.record.primary_organization = Some(org_id.clone());
        self.record.primary_user = Some(user.id.clone());

        if let Err(e) = self.commit() {
            tracing::error!(
                server_id = %self.record.id,
                user_id = %user.id,
                error = %e,
                "commit failed after minting primary user, removing user"
            );
            if let Err(remove_err) = self.ctx.inner.orgs.remove_user(&org_id, &user.id) {
                tracing::warn!(
                    user_id = %user.id,
                    error = %remove_err,
                    "failed removing freshly minted user"
                );
            }
            self.record.primary_organization = None;
            self.record.primary_user = None;
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.0.0.0/24", "10.0.0.0", "255.255.255.0")]
    #[case("10.0.0.0/22", "10.0.0.0", "255.255.252.0")]
    #[case("10.0.0.0/8", "10.0.0.0", "255.0.0.0")]
    #[case("192.168.1.0/32", "192.168.1.0", "255.255.255.255")]
    #[case("0.0.0.0/0", "0.0.0.0", "0.0.0.0")]
    fn network_splits_into_address_and_netmask(
        #[case] network: &str,
        #[case] address: &str,
        #[case] netmask: &str,
    ) {
        assert_eq!(
            parse_network(network).unwrap(),
            (address.to_string(), netmask.to_string())
        );
    }

    #[test]
    fn netmask_has_exactly_n_leading_ones() {
        for length in 0..=32u8 {
            let network = format!("10.0.0.0/{length}");
            let (_, netmask) = parse_network(&network).unwrap();
            let mask: Ipv4Addr = netmask.parse().unwrap();
            let bits = u32::from(mask);
            assert_eq!(bits.leading_ones(), u32::from(length), "length {length}");
            assert_eq!(bits.count_ones(), u32::from(length), "length {length}");
        }
    }

    #[test]
    fn bad_networks_are_rejected() {
        assert!(parse_network("not-a-network").is_err());
        assert!(parse_network("10.0.0.0/33").is_err());
        assert!(parse_network("10.0.0.256/24").is_err());
    }

    #[test]
    fn empty_local_networks_push_the_default_gateway() {
        assert_eq!(
            push_directives(&[]).unwrap(),
            "push \"redirect-gateway\""
        );
    }

    #[test]
    fn local_networks_push_one_route_each() {
        let locals = vec!["192.168.1.0/24".to_string(), "10.8.0.0/16".to_string()];
        assert_eq!(
            push_directives(&locals).unwrap(),
            "push \"route 192.168.1.0 255.255.255.0\"\npush \"route 10.8.0.0 255.255.0.0\""
        );
    }

    #[test]
    fn pem_block_skips_leading_text() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("cert.pem");
        fs::write(
            &path,
            "Certificate:\n    Data: ...\n-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n",
        )?;
        assert_eq!(
            pem_block(&path)?,
            "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----"
        );
        Ok(())
    }
}
