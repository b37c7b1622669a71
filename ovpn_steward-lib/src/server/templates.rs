//! Text rendered into the server working directory: the two daemon config
//! variants and the connection-time verification scripts.

use std::path::Path;

use super::record::Protocol;

pub(crate) struct ConfContext<'a> {
    pub port: u16,
    pub protocol: Protocol,
    pub interface: &'a str,
    pub ca_path: &'a Path,
    pub cert_path: &'a Path,
    pub key_path: &'a Path,
    pub tls_verify_path: &'a Path,
    pub dh_param_path: &'a Path,
    /// The virtual subnet as `address netmask`.
    pub server_line: &'a str,
    pub ifc_pool_path: &'a Path,
    pub push: &'a str,
    pub status_path: &'a Path,
    pub verb: u8,
    pub mute: u8,
}

pub(crate) fn server_conf(c: &ConfContext<'_>) -> String {
    format!(
        "port {port}\n\
         proto {protocol}\n\
         dev {interface}\n\
         ca {ca}\n\
         cert {cert}\n\
         key {key}\n\
         tls-verify {tls_verify}\n\
         dh {dh}\n\
         server {server}\n\
         ifconfig-pool-persist {pool}\n\
         {push}\n\
         keepalive 10 60\n\
         persist-tun\n\
         status {status} 1\n\
         status-version 2\n\
         verb {verb}\n\
         mute {mute}\n",
        port = c.port,
        protocol = c.protocol,
        interface = c.interface,
        ca = c.ca_path.display(),
        cert = c.cert_path.display(),
        key = c.key_path.display(),
        tls_verify = c.tls_verify_path.display(),
        dh = c.dh_param_path.display(),
        server = c.server_line,
        pool = c.ifc_pool_path.display(),
        push = c.push,
        status = c.status_path.display(),
        verb = c.verb,
        mute = c.mute,
    )
}

/// Variant with CA, certificate, key and DH parameters appended as inline
/// PEM blocks instead of file references.
pub(crate) fn inline_server_conf(c: &ConfContext<'_>) -> String {
    format!(
        "port {port}\n\
         proto {protocol}\n\
         dev {interface}\n\
         tls-verify {tls_verify}\n\
         server {server}\n\
         ifconfig-pool-persist {pool}\n\
         {push}\n\
         keepalive 10 60\n\
         persist-tun\n\
         status {status} 1\n\
         status-version 2\n\
         verb {verb}\n\
         mute {mute}\n",
        port = c.port,
        protocol = c.protocol,
        interface = c.interface,
        tls_verify = c.tls_verify_path.display(),
        server = c.server_line,
        pool = c.ifc_pool_path.display(),
        push = c.push,
        status = c.status_path.display(),
        verb = c.verb,
        mute = c.mute,
    )
}

/// Invoked by the daemon with the certificate depth and X.509 subject.
/// Accepts a client iff its common name is listed as valid in the index of
/// one attached organization.
pub(crate) fn tls_verify_script(
    orgs_path: &Path,
    index_name: &str,
    auth_log_path: &Path,
) -> String {
    format!(
        r#"#!/usr/bin/env python
import os
import sys
import time

ORGS_PATH = '{orgs}'
INDEX_NAME = '{index}'
AUTH_LOG_PATH = '{auth_log}'

def log_auth(message):
    with open(AUTH_LOG_PATH, 'a') as auth_log:
        auth_log.write('[%s] %s\n' % (time.strftime('%Y-%m-%d %H:%M:%S'), message))

def main():
    depth = int(sys.argv[1])
    subject = sys.argv[2]
    if depth != 0:
        sys.exit(0)

    common_name = None
    for part in subject.split('/'):
        if part.startswith('CN='):
            common_name = part[3:]
    if not common_name:
        log_auth('tls verify missing common name: %s' % subject)
        sys.exit(1)

    for org_id in os.listdir(ORGS_PATH):
        index_path = os.path.join(ORGS_PATH, org_id, INDEX_NAME)
        if not os.path.isfile(index_path):
            continue
        with open(index_path, 'r') as index_file:
            for line in index_file.readlines():
                fields = line.rstrip('\n').split('\t')
                if not fields or fields[0] != 'V':
                    continue
                if fields[-1].endswith('/CN=%s' % common_name):
                    sys.exit(0)

    log_auth('tls verify rejected common name: %s' % common_name)
    sys.exit(1)

main()
"#,
        orgs = orgs_path.display(),
        index = index_name,
        auth_log = auth_log_path.display(),
    )
}

/// Invoked by the daemon with the path of a file carrying the username and
/// the one time password. Validates the password against the user's OTP
/// secret with a one-slice drift window and a replay guard in the temp dir.
pub(crate) fn user_pass_verify_script(
    orgs_path: &Path,
    users_dir: &str,
    temp_path: &Path,
    auth_log_path: &Path,
) -> String {
    format!(
        r#"#!/usr/bin/env python
import base64
import hashlib
import hmac
import os
import struct
import sys
import time

ORGS_PATH = '{orgs}'
USERS_DIR = '{users_dir}'
TEMP_PATH = '{temp}'
AUTH_LOG_PATH = '{auth_log}'

def log_auth(message):
    with open(AUTH_LOG_PATH, 'a') as auth_log:
        auth_log.write('[%s] %s\n' % (time.strftime('%Y-%m-%d %H:%M:%S'), message))

def valid_codes(secret):
    key = base64.b32decode(secret.strip().upper().encode())
    codes = []
    period = int(time.time() // 30)
    for counter in (period - 1, period, period + 1):
        digest = hmac.new(key, struct.pack('>Q', counter), hashlib.sha1).digest()
        offset = digest[19] & 15
        code = struct.unpack('>I', digest[offset:offset + 4])[0] & 0x7fffffff
        codes.append('%06d' % (code % 1000000))
    return codes

def find_secret(username):
    for org_id in os.listdir(ORGS_PATH):
        secret_path = os.path.join(ORGS_PATH, org_id, USERS_DIR, username + '.otp')
        if os.path.isfile(secret_path):
            with open(secret_path, 'r') as secret_file:
                return secret_file.read()
    return None

def main():
    with open(sys.argv[1], 'r') as auth_file:
        username, password = [x.strip() for x in auth_file.readlines()[:2]]

    secret = find_secret(username)
    if not secret:
        log_auth('otp verify missing secret: %s' % username)
        sys.exit(1)

    if password not in valid_codes(secret):
        log_auth('otp verify rejected code: %s' % username)
        sys.exit(1)

    used_path = os.path.join(TEMP_PATH, 'otp_%s_%s' % (username, password))
    if os.path.exists(used_path):
        log_auth('otp verify replayed code: %s' % username)
        sys.exit(1)
    open(used_path, 'w').close()
    sys.exit(0)

main()
"#,
        orgs = orgs_path.display(),
        users_dir = users_dir,
        temp = temp_path.display(),
        auth_log = auth_log_path.display(),
    )
}
