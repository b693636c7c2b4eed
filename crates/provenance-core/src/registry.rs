use crate::substrate::{LedgerKey, LedgerSubstrate, WriteSet};
use crate::{
    decode_json, encode_json, validate_content_hash, ProvenanceError, TraceabilityCode, TxId, User,
    UserId, UserType,
};

/// Participant records and the code back-links kept on them.
///
/// The fruit list is an index. It is never consulted to authorize a write.
pub struct UserRegistry<'a, L: ?Sized> {
    substrate: &'a L,
}

impl<'a, L: LedgerSubstrate + ?Sized> UserRegistry<'a, L> {
    pub fn new(substrate: &'a L) -> Self {
        Self { substrate }
    }

    /// # Errors
    /// Returns [`ProvenanceError::Encoding`] when the stored user does not decode.
    pub fn load(&self, user_id: &UserId) -> Result<Option<(User, TxId)>, ProvenanceError> {
        let Some(stored) = self.substrate.read(&LedgerKey::user(user_id))? else {
            return Ok(None);
        };
        let user: User = decode_json(&stored.value)?;
        Ok(Some((user, stored.version)))
    }

    /// # Errors
    /// Returns [`ProvenanceError::NotFound`] for an unregistered user.
    pub fn get(&self, user_id: &UserId) -> Result<User, ProvenanceError> {
        self.load(user_id)?
            .map(|(user, _)| user)
            .ok_or_else(|| ProvenanceError::NotFound { key: LedgerKey::user(user_id).to_string() })
    }

    /// Stage the creation of a new user with an empty fruit list.
    ///
    /// # Errors
    /// - [`ProvenanceError::Validation`] when `real_info_hash` is not a content hash.
    /// - [`ProvenanceError::DuplicateUser`] when `user_id` is already registered.
    pub fn stage_register(
        &self,
        write_set: &mut WriteSet,
        user_id: UserId,
        user_type: UserType,
        real_info_hash: String,
    ) -> Result<User, ProvenanceError> {
        validate_content_hash("realInfoHash", &real_info_hash)?;
        if self.load(&user_id)?.is_some() {
            return Err(ProvenanceError::DuplicateUser { user_id: user_id.to_string() });
        }
        let user = User { user_id, user_type, real_info_hash, fruit_list: Vec::new() };
        let key = LedgerKey::user(&user.user_id);
        write_set.record_read(key.clone(), None);
        write_set.put(key, encode_json(&user)?);
        Ok(user)
    }

    /// Stage appending `code` to the user's fruit list. Re-linking an already
    /// linked code stages nothing and returns `false`.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::NotFound`] for an unregistered user.
    pub fn stage_link(
        &self,
        write_set: &mut WriteSet,
        user_id: &UserId,
        code: &TraceabilityCode,
    ) -> Result<bool, ProvenanceError> {
        let Some((mut user, version)) = self.load(user_id)? else {
            return Err(ProvenanceError::NotFound { key: LedgerKey::user(user_id).to_string() });
        };
        if user.fruit_list.contains(code) {
            return Ok(false);
        }
        user.fruit_list.push(code.clone());
        let key = LedgerKey::user(user_id);
        write_set.record_read(key.clone(), Some(version));
        write_set.put(key, encode_json(&user)?);
        Ok(true)
    }

    /// Link `code` to `user_id` in its own transaction.
    ///
    /// # Errors
    /// [`ProvenanceError::NotFound`] for an unregistered user, or
    /// [`ProvenanceError::Conflict`] when the user record changed concurrently.
    pub fn link_fruit(&self, user_id: &UserId, code: &TraceabilityCode) -> Result<(), ProvenanceError> {
        let ctx = self.substrate.begin()?;
        let mut write_set = WriteSet::new();
        if self.stage_link(&mut write_set, user_id, code)? {
            self.substrate.commit(ctx, write_set)?;
        }
        Ok(())
    }

    /// Codes the user has acted on, in the order they were first linked.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::NotFound`] for an unregistered user.
    pub fn list_fruits(&self, user_id: &UserId) -> Result<Vec<TraceabilityCode>, ProvenanceError> {
        Ok(self.get(user_id)?.fruit_list)
    }
}
