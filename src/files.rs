use hmac::Mac;
use log::debug;
use crate::Config;

type HmacSha512 = hmac::Hmac<sha2::Sha512>;

const LINK_LIFETIME_MINUTES: i64 = 5;

pub struct FileKey<'a> {
    file_path: &'a str,
    key: &'a [u8],
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("malformed file key")]
    Malformed,
    #[error("invalid file key")]
    BadSignature,
    #[error("file key expired")]
    Expired,
}

fn file_mac(key: &[u8], file_path: &str, expiry: &str) -> Option<HmacSha512> {
    let file_path = base64::encode_config(file_path.as_bytes(), base64::URL_SAFE_NO_PAD);
    let mut mac = HmacSha512::new_from_slice(key).ok()?;
    let msg = format!("{};{}", file_path, expiry);
    mac.update(msg.as_bytes());
    Some(mac)
}

impl<'a> FileKey<'a> {
    pub fn new(file_path: &'a str, key: &'a [u8]) -> FileKey<'a> {
        FileKey {
            file_path,
            key,
        }
    }

    fn with_expiry(&self, expiry: chrono::DateTime<chrono::Utc>) -> Option<String> {
        let expiry = expiry.timestamp().to_string();
        let mac = file_mac(self.key, self.file_path, &expiry)?;
        let code_bytes = base64::encode_config(mac.finalize().into_bytes(), base64::URL_SAFE_NO_PAD);

        Some(format!("{};{}", expiry, code_bytes))
    }
}

impl std::fmt::Display for FileKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = self.with_expiry(chrono::Utc::now() + chrono::Duration::minutes(LINK_LIFETIME_MINUTES))
            .ok_or(std::fmt::Error)?;
        f.write_str(&key)
    }
}

/// A short-lived download link for a file in the files directory.
pub fn file_url(file_path: &str, files_key: &[u8]) -> String {
    format!("/files/{}?key={}", file_path, FileKey::new(file_path, files_key))
}

pub fn verify_file_key(file_path: &str, key: &str, files_key: &[u8]) -> Result<(), KeyError> {
    let (part_1, part_2) = match key.split_once(';') {
        Some(p) => p,
        None => return Err(KeyError::Malformed)
    };

    let expiry = match part_1.parse::<i64>() {
        Ok(c) => match chrono::DateTime::<chrono::Utc>::from_timestamp(c, 0) {
            Some(c) => c,
            None => return Err(KeyError::Malformed)
        }
        Err(_) => return Err(KeyError::Malformed)
    };
    let code_bytes = match base64::decode_config(part_2, base64::URL_SAFE_NO_PAD) {
        Ok(c) => c,
        Err(_) => return Err(KeyError::Malformed)
    };

    let mac = match file_mac(files_key, file_path, part_1) {
        Some(m) => m,
        None => return Err(KeyError::BadSignature)
    };
    if mac.verify_slice(&code_bytes).is_err() {
        return Err(KeyError::BadSignature);
    }

    if expiry < chrono::Utc::now() {
        return Err(KeyError::Expired);
    }

    Ok(())
}

#[get("/files/<file..>?<key>")]
pub async fn authenticated_files(file: std::path::PathBuf, key: &str, config: &rocket::State<Config>) -> Result<Option<rocket::fs::NamedFile>, rocket::http::Status> {
    match verify_file_key(&file.to_string_lossy(), key, &config.files_key) {
        Ok(()) => {}
        Err(KeyError::Malformed) => return Err(rocket::http::Status::UnprocessableEntity),
        Err(err) => {
            debug!("Refusing {}: {}", file.display(), err);
            return Err(rocket::http::Status::Forbidden);
        }
    }

    Ok(rocket::fs::NamedFile::open(config.files_dir.join(file)).await.ok())
}
