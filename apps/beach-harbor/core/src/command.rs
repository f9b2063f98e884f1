use std::fmt;

use crate::event::MembershipOp;
use crate::room::RoomName;

/// A membership command bound for the upstream transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    pub op: MembershipOp,
    pub room: RoomName,
}

impl OutboundCommand {
    pub fn join(room: RoomName) -> Self {
        Self {
            op: MembershipOp::Join,
            room,
        }
    }

    pub fn part(room: RoomName) -> Self {
        Self {
            op: MembershipOp::Part,
            room,
        }
    }

    /// Protocol text including the line terminator.
    pub fn to_wire(&self) -> String {
        format!("{} {}\r\n", self.op, self.room)
    }
}

impl fmt::Display for OutboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.room)
    }
}
