//! Encryption capability consumed by connections.

use crate::EncryptionError;

/// Transforms whole packet bodies for frames flagged as encrypted.
///
/// Providers are registered with the service container as
/// `Arc<dyn EncryptionProvider>` and resolved per connection, so each
/// connection may carry its own key material. The frame length always
/// describes the encrypted bytes.
pub trait EncryptionProvider: Send + Sync + 'static {
    /// Encrypts a serialized body.
    ///
    /// # Errors
    /// Returns an [`EncryptionError`] if the provider cannot encrypt.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, EncryptionError>;

    /// Decrypts a received body.
    ///
    /// # Errors
    /// Returns an [`EncryptionError`] if the body is not valid ciphertext.
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, EncryptionError>;
}
