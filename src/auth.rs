//! Challenge-response authentication against the band's pre-shared key.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use log::{debug, warn};
use uuid::Uuid;

use crate::codec::{encode_challenge_response, parse_challenge};
use crate::error::{BandError, Result};
use crate::protocol::{AUTH_CMD_REQUEST_CHALLENGE, AUTH_RESP_AUTH_OK, CHALLENGE_LEN};
use crate::session::Shared;
use crate::transport::Transport;

/// Encrypt a challenge with AES-128 in ECB mode, no padding.
///
/// The challenge is exactly one block, so ECB reduces to a single block
/// encryption.
pub fn encrypt_challenge(key: &[u8; 16], challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(challenge);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; CHALLENGE_LEN];
    out.copy_from_slice(&block);
    out
}

/// Run the handshake on `auth`.  Notifications on `auth` are left disabled.
pub(crate) async fn authenticate<T: Transport>(shared: &Shared<T>, auth: Uuid) -> Result<()> {
    shared.set_notifications(auth, true).await?;
    shared.clear_queue(auth);

    shared.write(auth, &AUTH_CMD_REQUEST_CHALLENGE).await?;
    let resp = shared.expect_notification(auth, "auth challenge").await?;
    let challenge = parse_challenge(&resp)?;
    debug!("received auth challenge");

    let encrypted = encrypt_challenge(shared.identity.key(), &challenge);
    shared.write(auth, &encode_challenge_response(&encrypted)).await?;
    let result = shared.expect_notification(auth, "auth result").await?;
    if result != AUTH_RESP_AUTH_OK {
        warn!("self auth failed, response: {result:02x?}");
        return Err(BandError::AuthenticationFailed);
    }
    debug!("self authenticated");

    shared.set_notifications(auth, false).await
}
