use formflow_core::connection::ConnectionConfig;
use formflow_core::encryption::EncryptionService;

use crate::error::ConnectorError;

/// Decrypt and parse a plugin's stored connection config.
///
/// The result lives only as long as pool construction; callers must not
/// keep it.
pub(crate) fn decrypt_config(
    encryption: &EncryptionService,
    ciphertext: &str,
) -> Result<ConnectionConfig, ConnectorError> {
    let map = encryption.decrypt(ciphertext)?;
    ConnectionConfig::from_map(map).map_err(ConnectorError::InvalidConfig)
}
