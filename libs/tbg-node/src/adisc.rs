//! Address-discovery primitive.
//!
//! The node side of discovery is deliberately dumb: one command byte
//! selects match predicates and actions, and the host composes those
//! into the full two-stage probe. Matching narrows which nodes act on a
//! broadcast; the shortlist flag serialises assignment when two nodes
//! share an id half-word prefix.

use tbg_protocol::{
    AdiscFlags, ErrorCode, Msg, ADISC_REQ_DATA_ADDR, ADISC_REQ_DATA_CMD, ADISC_REQ_DATA_ID0,
    ADISC_REQ_LEN_ID, ADISC_REQ_LEN_MIN, ADISC_RESP_DATA_HARD_ADDR, ADISC_RESP_DATA_SOFT_ADDR,
    ID_HALF_LEN,
};

use crate::{HandlerResult, Node};

pub(crate) fn handle(node: &mut Node, req: &Msg, resp: &mut Msg) -> HandlerResult {
    if req.len < ADISC_REQ_LEN_MIN {
        return Err(ErrorCode::Length);
    }

    let cmd = AdiscFlags::from_bits_truncate(req.data[ADISC_REQ_DATA_CMD]);
    let mut not_match = false;

    if cmd.contains(AdiscFlags::MATCH_ID) {
        if req.len < ADISC_REQ_LEN_ID {
            return Err(ErrorCode::Length);
        }
        let ours = node.unique_id_half(cmd.contains(AdiscFlags::MATCH_ID_MSW));
        let theirs = &req.data[ADISC_REQ_DATA_ID0..ADISC_REQ_DATA_ID0 + ID_HALF_LEN];
        not_match = theirs != ours;
    }

    if cmd.contains(AdiscFlags::MATCH_SHORTLIST) {
        not_match = !(!not_match && node.shortlist());
    }

    // A requested match that failed: perform no actions at all.
    if not_match {
        return Ok(false);
    }

    if cmd.contains(AdiscFlags::ASSIGN_ADDR) {
        node.set_addr(req.data[ADISC_REQ_DATA_ADDR]);
        log::info!("soft address assigned: {}", node.addr());
    }
    if cmd.contains(AdiscFlags::SET_SHORTLIST) {
        node.set_shortlist(true);
    }
    if cmd.contains(AdiscFlags::CLR_SHORTLIST) {
        node.set_shortlist(false);
    }

    if cmd.contains(AdiscFlags::RETURN_ID) {
        let half = node.unique_id_half(cmd.contains(AdiscFlags::RETURN_ID_MSW));
        resp.data[..ID_HALF_LEN].copy_from_slice(half);
        resp.data[ADISC_RESP_DATA_SOFT_ADDR] = node.addr();
        resp.data[ADISC_RESP_DATA_HARD_ADDR] = 0xff; // hard addressing not fitted
        resp.len = 8;
        return Ok(true);
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use crate::testutil::*;
    use tbg_protocol::{
        adisc_data, adisc_resp_id, AdiscFlags, ErrorCode, Msg, MsgType, ADDR_BROADCAST,
        ADDR_UNASSIGNED, PORT_ADISC,
    };

    const ID_LO: u64 = 0x0708_090A_0B0C;
    const ID_HI: u64 = 0x0102_0304_0506;

    fn adisc_req(dst: u8, cmd: AdiscFlags, addr: u8, id: u64, len: u8) -> Msg {
        let mut req = Msg::request(dst, PORT_ADISC, &adisc_data(cmd, addr, id));
        req.len = len;
        req.set_src_addr(62);
        req.set_src_port(9);
        req
    }

    #[test]
    fn return_id_reports_half_and_address() {
        let mut node = bare_node();
        let req = adisc_req(
            ADDR_BROADCAST,
            AdiscFlags::RETURN_ID | AdiscFlags::RETURN_ID_MSW,
            0,
            0,
            2,
        );
        let resp = node.dispatch(&req).unwrap();
        assert_eq!(resp.msg_type(), MsgType::Response);
        assert_eq!(adisc_resp_id(&resp), ID_HI);
        assert_eq!(resp.data[6], ADDR_UNASSIGNED);
        assert_eq!(resp.data[7], 0xff);
        // Responding to a broadcast: source address must still route.
        assert_eq!(resp.src_addr(), ADDR_UNASSIGNED);
    }

    #[test]
    fn match_id_requires_full_length() {
        let mut node = bare_node();
        let req = adisc_req(ADDR_BROADCAST, AdiscFlags::MATCH_ID, 0, ID_LO, 7);
        let resp = node.dispatch(&req);
        // Broadcast: the length error is swallowed.
        assert!(resp.is_none());

        let req = adisc_req(ADDR_UNASSIGNED, AdiscFlags::MATCH_ID, 0, ID_LO, 7);
        let resp = node.dispatch(&req).unwrap();
        assert_eq!(resp.msg_type(), MsgType::ErrorResponse);
        assert_eq!(resp.data[0], ErrorCode::Length as u8);
    }

    #[test]
    fn too_short_request_is_length_error() {
        let mut node = bare_node();
        let req = adisc_req(ADDR_UNASSIGNED, AdiscFlags::RETURN_ID, 0, 0, 1);
        let resp = node.dispatch(&req).unwrap();
        assert_eq!(resp.data[0], ErrorCode::Length as u8);
    }

    #[test]
    fn mismatched_id_does_nothing() {
        let mut node = bare_node();
        let cmd = AdiscFlags::MATCH_ID | AdiscFlags::ASSIGN_ADDR | AdiscFlags::RETURN_ID;
        let req = adisc_req(ADDR_BROADCAST, cmd, 4, ID_LO + 1, 8);
        assert!(node.dispatch(&req).is_none());
        assert_eq!(node.addr(), ADDR_UNASSIGNED);
    }

    #[test]
    fn matched_assignment_reports_new_address() {
        let mut node = bare_node();
        let cmd = AdiscFlags::MATCH_ID | AdiscFlags::ASSIGN_ADDR | AdiscFlags::RETURN_ID;
        let req = adisc_req(ADDR_BROADCAST, cmd, 4, ID_LO, 8);
        let resp = node.dispatch(&req).unwrap();
        assert_eq!(node.addr(), 4);
        assert_eq!(resp.data[6], 4);
        assert_eq!(adisc_resp_id(&resp), ID_LO);
        // The response itself still left under the old source address.
        assert_eq!(resp.src_addr(), ADDR_UNASSIGNED);
    }

    #[test]
    fn match_high_half_selects_half_word() {
        let mut node = bare_node();
        let cmd = AdiscFlags::MATCH_ID | AdiscFlags::MATCH_ID_MSW | AdiscFlags::RETURN_ID;
        // Low half offered against a high-half match: no reply.
        let req = adisc_req(ADDR_BROADCAST, cmd, 0, ID_LO, 8);
        assert!(node.dispatch(&req).is_none());
        let req = adisc_req(ADDR_BROADCAST, cmd, 0, ID_HI, 8);
        assert!(node.dispatch(&req).is_some());
    }

    #[test]
    fn shortlist_gates_matching() {
        let mut node = bare_node();

        // Shortlist clear: match-shortlist fails even with a good id.
        let cmd = AdiscFlags::MATCH_ID | AdiscFlags::MATCH_SHORTLIST | AdiscFlags::RETURN_ID;
        let req = adisc_req(ADDR_BROADCAST, cmd, 0, ID_LO, 8);
        assert!(node.dispatch(&req).is_none());

        // Set the shortlist via a high-half match, then the low-half
        // match-shortlist form responds.
        let set = AdiscFlags::MATCH_ID | AdiscFlags::MATCH_ID_MSW | AdiscFlags::SET_SHORTLIST;
        assert!(node.dispatch(&adisc_req(ADDR_BROADCAST, set, 0, ID_HI, 8)).is_none());
        assert!(node.dispatch(&req).is_some());

        // Clear-shortlist takes it away again.
        let clr = AdiscFlags::CLR_SHORTLIST;
        assert!(node.dispatch(&adisc_req(ADDR_BROADCAST, clr, 0, 0, 2)).is_none());
        assert!(node.dispatch(&req).is_none());
    }

    #[test]
    fn probe_is_idempotent() {
        // A bare return-id probe, replayed with the returned id matched,
        // yields the same response and changes nothing.
        let mut node = bare_node();
        let first = node
            .dispatch(&adisc_req(ADDR_BROADCAST, AdiscFlags::RETURN_ID, 0, 0, 2))
            .unwrap();
        let id = adisc_resp_id(&first);
        let second = node
            .dispatch(&adisc_req(
                ADDR_BROADCAST,
                AdiscFlags::MATCH_ID | AdiscFlags::RETURN_ID,
                0,
                id,
                8,
            ))
            .unwrap();
        assert_eq!(first.payload(), second.payload());
        assert_eq!(node.addr(), ADDR_UNASSIGNED);
    }

    #[test]
    fn unassign_broadcast_resets_address() {
        let mut node = bare_node();
        node.set_addr(7);
        node.set_shortlist(true);
        let cmd = AdiscFlags::ASSIGN_ADDR | AdiscFlags::CLR_SHORTLIST;
        let req = adisc_req(ADDR_BROADCAST, cmd, ADDR_UNASSIGNED, 0, 2);
        assert!(node.dispatch(&req).is_none());
        assert_eq!(node.addr(), ADDR_UNASSIGNED);
        assert!(!node.shortlist());
    }
}
