/// Node registration endpoint (POST, batch of records)
pub const REGISTER_PATH: &str = "/v1/register";
/// Node check-in endpoint (POST, batch of records)
pub const CHECKIN_PATH: &str = "/v1/checkin";
/// Incremental listing endpoint (GET, `?since=<unix millis>`)
pub const RECORDS_PATH: &str = "/v1/records";
/// Partner-to-partner delta endpoint, appended to each partner base URL
pub const COORDINATION_PATH: &str = "/coord";

/// Query / form parameter names
pub const PARAM_SINCE: &str = "since";
pub const PARAM_PAYLOAD: &str = "payload";
pub const PARAM_DIGEST: &str = "digest";

/// Response header carrying the base64 SHA1withRSA signature of the body
pub const DIGEST_HEADER: &str = "x-directory-digest";

/// Leading tag byte of an encoded replication delta
pub const DELTA_CHECKIN: u8 = 0x01;
pub const DELTA_NEWREG: u8 = 0x02;

/// Segments of a public key string, `"<algorithm>:<format>:<base64>"`
pub const KEY_ALGORITHM: &str = "RSA";
pub const KEY_FORMAT: &str = "X.509";
