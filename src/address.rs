pub const UNASSIGNED: u16 = 0x0000;
pub const ALL_NODES: u16 = 0xFFFF;

pub fn is_unicast(addr: u16) -> bool {
    addr != UNASSIGNED && addr & 0x8000 == 0
}
