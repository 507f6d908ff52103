//! The null security class: no authentication, no protection.

use super::SecurityObject;

/// Security class index conventionally used for [`NullSecurity`].
pub const NULL_SECURITY_INDEX: u8 = 0;

/// Security object that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSecurity;

impl NullSecurity {
    /// Create the null security object.
    pub fn new() -> Self {
        Self
    }
}

impl SecurityObject for NullSecurity {
    fn name(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ConnType;
    use crate::security::SecurityConn;
    use crate::transport::Packet;

    #[test]
    fn test_null_accepts_everything() {
        let security = NullSecurity::new();
        let mut data = None;
        let mut conn = SecurityConn {
            epoch: 1,
            cid: 4,
            kind: ConnType::Server,
            security_index: NULL_SECURITY_INDEX,
            service_id: 1,
            data: &mut data,
        };
        let mut packet = Packet::standalone();

        assert!(security.new_connection(&mut conn).is_ok());
        assert!(security.check_authentication(&mut conn));
        assert!(security.prepare_outgoing(&mut conn, &mut packet).is_ok());
        assert!(security.check_incoming(&mut conn, &mut packet).is_ok());
        assert!(security.check_response(&mut conn, &packet).is_ok());
        assert_eq!(security.stats(&mut conn), Default::default());
        assert_eq!(security.name(), "null");
    }
}
