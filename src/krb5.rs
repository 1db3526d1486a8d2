//! Delegated Kerberos credentials.
//!
//! A [`Credential`] is the native form of a forwarded ticket. It is flattened
//! into an attribute list for transport inside cred tokens and handed to the
//! [`KerberosLayer`] for everything that needs a real Kerberos library.
//!
//! Attribute layout:
//!
//! ```text
//! c s          client / server principal
//! K k          session key enctype / contents
//! ta ts te tr  auth / start / end / renew-till times
//! i f          is-skey / ticket flags
//! na A<i> a<i> address count, per-address type and contents
//! t t2         ticket / optional second ticket
//! nd D<i> d<i> authorization data count, per-record type and contents
//! ```

use std::fmt;
use std::str::FromStr;

use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::attrs::AttrList;
use crate::encoding::{decode_record, encode_record, Record, Rule, RuleKind, Value};
use crate::error::{Result, WebAuthError};
use crate::tokens::CredToken;

#[derive(Debug, Clone, PartialEq, Eq, Zeroize)]
pub struct Address {
    pub addr_type: i32,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Zeroize)]
pub struct AuthData {
    pub ad_type: i32,
    pub contents: Vec<u8>,
}

/// A forwarded Kerberos ticket with its session key
/// Automatically zeroized on drop
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    pub client: String,
    pub server: String,
    pub key_type: i32,
    pub key: Vec<u8>,
    pub auth_time: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub renew_till: u64,
    pub is_skey: bool,
    pub flags: u32,
    pub addresses: Vec<Address>,
    pub ticket: Vec<u8>,
    /// An empty second ticket is not encoded and decodes as `None`
    pub second_ticket: Option<Vec<u8>>,
    pub auth_data: Vec<AuthData>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("client", &self.client)
            .field("server", &self.server)
            .field("end_time", &self.end_time)
            .field("addresses", &self.addresses.len())
            .field("auth_data", &self.auth_data.len())
            .finish_non_exhaustive()
    }
}

const ADDRESS_RULES: &[Rule] = &[
    Rule::new("A", "address type", RuleKind::Int32),
    Rule::new("a", "address contents", RuleKind::Data),
];

const AUTH_DATA_RULES: &[Rule] = &[
    Rule::new("D", "authorization data type", RuleKind::Int32),
    Rule::new("d", "authorization data contents", RuleKind::Data),
];

const CREDENTIAL_RULES: &[Rule] = &[
    Rule::new("c", "client principal", RuleKind::String),
    Rule::new("s", "server principal", RuleKind::String),
    Rule::new("K", "session key type", RuleKind::Int32),
    Rule::new("k", "session key", RuleKind::Data),
    Rule::new("ta", "auth time", RuleKind::Time),
    Rule::new("ts", "start time", RuleKind::Time),
    Rule::new("te", "end time", RuleKind::Time),
    Rule::new("tr", "renew till", RuleKind::Time),
    Rule::new("i", "is skey", RuleKind::Int32),
    Rule::new("f", "ticket flags", RuleKind::Uint32),
    Rule::new("na", "addresses", RuleKind::Repeat(ADDRESS_RULES)).optional(),
    Rule::new("t", "ticket", RuleKind::Data),
    Rule::new("t2", "second ticket", RuleKind::Data).optional(),
    Rule::new("nd", "authorization data", RuleKind::Repeat(AUTH_DATA_RULES)).optional(),
];

fn typed_record(type_attr: &'static str, data_attr: &'static str, kind: i32, contents: &[u8]) -> Record {
    let mut r = Record::new();
    r.set(type_attr, Value::Int32(kind))
        .set(data_attr, Value::Data(contents.to_vec()));
    r
}

fn typed_pair(r: &Record, type_attr: &str, data_attr: &str) -> (i32, Vec<u8>) {
    (
        r.int32(type_attr).unwrap_or(0),
        r.data(data_attr).unwrap_or_default().to_vec(),
    )
}

impl Credential {
    fn to_record(&self) -> Record {
        let addresses = self
            .addresses
            .iter()
            .map(|a| typed_record("A", "a", a.addr_type, &a.contents))
            .collect();
        let auth_data = self
            .auth_data
            .iter()
            .map(|d| typed_record("D", "d", d.ad_type, &d.contents))
            .collect();

        let mut r = Record::new();
        r.set("c", Value::String(self.client.clone()))
            .set("s", Value::String(self.server.clone()))
            .set("K", Value::Int32(self.key_type))
            .set("k", Value::Data(self.key.clone()))
            .set("ta", Value::Time(self.auth_time))
            .set("ts", Value::Time(self.start_time))
            .set("te", Value::Time(self.end_time))
            .set("tr", Value::Time(self.renew_till))
            .set("i", Value::Int32(i32::from(self.is_skey)))
            .set("f", Value::Uint32(self.flags))
            .set("na", Value::Repeat(addresses))
            .set("t", Value::Data(self.ticket.clone()))
            .set_opt("t2", self.second_ticket.clone().filter(|t| !t.is_empty()).map(Value::Data))
            .set("nd", Value::Repeat(auth_data));
        r
    }

    /// Flatten to attribute bytes; the second value is the ticket end time
    pub fn encode(&self) -> Result<(Vec<u8>, u64)> {
        let bytes = encode_record(CREDENTIAL_RULES, &self.to_record(), 0)?.encode()?;
        Ok((bytes, self.end_time))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let attrs = AttrList::decode(bytes)?;
        let r = decode_record(CREDENTIAL_RULES, &attrs)?;
        let string = |name: &str| {
            r.string(name)
                .map(str::to_owned)
                .ok_or_else(|| WebAuthError::corrupt(format!("credential missing {name}")))
        };
        let time = |name: &str| r.time(name).unwrap_or(0);

        Ok(Self {
            client: string("c")?,
            server: string("s")?,
            key_type: r.int32("K").unwrap_or(0),
            key: r.data("k").unwrap_or_default().to_vec(),
            auth_time: time("ta"),
            start_time: time("ts"),
            end_time: time("te"),
            renew_till: time("tr"),
            is_skey: r.int32("i").unwrap_or(0) != 0,
            flags: r.uint32("f").unwrap_or(0),
            addresses: r
                .repeat("na")
                .iter()
                .map(|a| {
                    let (addr_type, contents) = typed_pair(a, "A", "a");
                    Address { addr_type, contents }
                })
                .collect(),
            ticket: r.data("t").unwrap_or_default().to_vec(),
            second_ticket: r.data("t2").map(<[u8]>::to_vec),
            auth_data: r
                .repeat("nd")
                .iter()
                .map(|d| {
                    let (ad_type, contents) = typed_pair(d, "D", "d");
                    AuthData { ad_type, contents }
                })
                .collect(),
        })
    }
}

/// Name of a ticket cache owned by the Kerberos layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle(pub String);

/// Operations that need a real Kerberos library
pub trait KerberosLayer: Send + Sync {
    /// Read the credential for `server` out of a ticket cache
    fn export_credential(&self, session: &SessionHandle, server: &str) -> Result<Credential>;

    /// Store a credential, into `session` if given or a new cache otherwise
    fn import_credential(&self, session: Option<&SessionHandle>, credential: Credential) -> Result<SessionHandle>;

    /// Verify a `krb5` id token authenticator and return the client principal
    fn verify_authenticator(&self, data: &[u8]) -> Result<String>;
}

/// Delegated credential kinds the engine can handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialType {
    Krb5,
}

impl CredentialType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CredentialType::Krb5 => "krb5",
        }
    }

    /// Export the credential for `server` as an opaque blob and its expiration
    pub fn export_credential(
        self,
        layer: &dyn KerberosLayer,
        session: &SessionHandle,
        server: &str,
    ) -> Result<(Vec<u8>, u64)> {
        match self {
            CredentialType::Krb5 => layer.export_credential(session, server)?.encode(),
        }
    }

    pub fn import_credential(
        self,
        layer: &dyn KerberosLayer,
        session: Option<&SessionHandle>,
        blob: &[u8],
    ) -> Result<SessionHandle> {
        match self {
            CredentialType::Krb5 => layer.import_credential(session, Credential::decode(blob)?),
        }
    }

    /// Load every gathered credential of this type into one ticket cache
    ///
    /// Returns `None` when none of `creds` is of this type.
    pub fn prepare_for_use(self, layer: &dyn KerberosLayer, creds: &[CredToken]) -> Result<Option<SessionHandle>> {
        let mut session = None;
        for cred in creds.iter().filter(|c| c.cred_type == self.as_str()) {
            let handle = self.import_credential(layer, session.as_ref(), &cred.data)?;
            debug!(service = %cred.service, cache = %handle.0, "Imported delegated credential");
            session = Some(handle);
        }
        Ok(session)
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialType {
    type Err = WebAuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "krb5" => Ok(CredentialType::Krb5),
            other => Err(WebAuthError::invalid(format!("unsupported credential type {other:?}"))),
        }
    }
}

// ============================================================
// TESTS
// ============================================================
