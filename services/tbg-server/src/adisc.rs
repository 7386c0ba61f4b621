//! Host-side address discovery.
//!
//! The bus is a shared broadcast medium and freshly powered nodes all
//! sit at the unassigned address, so discovery has to tolerate
//! colliding answers. CAN arbitration lets the lowest id win a
//! collision; the probe narrows its match predicate in two stages
//! (high id half, then low half per high half) until single nodes can
//! be claimed one at a time through the shortlist flag.

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use tbg_protocol::{
    adisc_data, adisc_resp_id, AdiscFlags, GlobalConf, ADDR_BROADCAST, ADDR_UNASSIGNED,
    ADISC_RESP_DATA_SOFT_ADDR, PORT_ADISC,
};

use crate::Tbg;

/// Base adisc timeout. Stage one collects for four of these, stage two
/// for two.
const ADISC_TIMEOUT: Duration = Duration::from_millis(20);

/// Nodes need a moment to act on fire-and-forget broadcasts.
const ADISC_SETTLE: Duration = Duration::from_millis(1);

/// Addresses handed out by auto-assignment. 62 belongs to the daemon.
const ASSIGN_FIRST: u8 = 1;
const ASSIGN_LAST: u8 = 61;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdiscMode {
    /// Enumerate whatever the nodes currently claim to be.
    Refresh,
    /// Knock every node back to the unassigned address first.
    Reset,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub addr: u8,
    pub id_msw: u64,
    pub id_lsw: u64,
    pub product_id: Option<String>,
}

impl NodeInfo {
    pub fn id_string(&self) -> String {
        format!("0x{:012X}{:012X}", self.id_msw, self.id_lsw)
    }

    pub fn to_json(&self) -> serde_json::Value {
        // Product descriptors are themselves JSON; embed them as such
        // when they parse, as a plain string when they don't.
        let product = match self.product_id {
            Some(ref p) => serde_json::from_str(p)
                .unwrap_or_else(|_| serde_json::Value::String(p.clone())),
            None => serde_json::Value::Null,
        };
        serde_json::json!({
            "addr": self.addr,
            "id": self.id_string(),
            "product": product,
        })
    }
}

/// Lowest address in the assignable range not claimed by any
/// inventoried node.
pub fn lowest_free_addr(nodes: &[NodeInfo]) -> Option<u8> {
    let mut used = [false; 64];
    for n in nodes {
        if n.addr != ADDR_UNASSIGNED {
            used[n.addr as usize & 0x3f] = true;
        }
    }
    (ASSIGN_FIRST..=ASSIGN_LAST).find(|&a| !used[a as usize])
}

impl Tbg {
    /// Broadcast an address reset: every node back to 63, shortlists
    /// cleared. Fire-and-forget, so give the nodes a moment.
    pub fn adisc_unassign(&mut self, addr: u8) -> io::Result<()> {
        let cmd = AdiscFlags::ASSIGN_ADDR | AdiscFlags::CLR_SHORTLIST;
        self.request(addr, PORT_ADISC, &[cmd.bits(), ADDR_UNASSIGNED])?;
        thread::sleep(ADISC_SETTLE);
        Ok(())
    }

    pub fn clear_shortlist(&mut self, addr: u8) -> io::Result<()> {
        self.request(
            ADDR_BROADCAST,
            PORT_ADISC,
            &[AdiscFlags::CLR_SHORTLIST.bits(), addr],
        )?;
        thread::sleep(ADISC_SETTLE);
        Ok(())
    }

    /// Stage one: collect the set of distinct high id halves.
    fn adisc_stage1(&mut self, addr: u8, window: Duration) -> io::Result<Vec<u64>> {
        let probe = adisc_data(AdiscFlags::RETURN_ID | AdiscFlags::RETURN_ID_MSW, 0, 0);
        self.request(addr, PORT_ADISC, &probe[..2])?;

        let deadline = Instant::now() + window;
        let mut msw_ids = Vec::new();
        while let Some(resp) = self.wait_from_until(None, Some(PORT_ADISC), deadline)? {
            if resp.is_error_response() {
                continue;
            }
            msw_ids.push(adisc_resp_id(&resp));
        }
        msw_ids.sort_unstable();
        msw_ids.dedup();
        log::debug!("adisc stage 1: {} distinct high halves", msw_ids.len());
        Ok(msw_ids)
    }

    /// Stage two: per high half, collect low halves and reported
    /// addresses. Duplicate (hi, lo) pairs stay distinct: the address
    /// byte in the response is the authoritative discriminator.
    fn adisc_stage2(
        &mut self,
        addr: u8,
        msw_ids: &[u64],
        window: Duration,
    ) -> io::Result<Vec<NodeInfo>> {
        let mut nodes = Vec::new();
        for &id_msw in msw_ids {
            let probe = adisc_data(
                AdiscFlags::MATCH_ID | AdiscFlags::MATCH_ID_MSW | AdiscFlags::RETURN_ID,
                0,
                id_msw,
            );
            self.request(addr, PORT_ADISC, &probe)?;

            let deadline = Instant::now() + window;
            while let Some(resp) = self.wait_from_until(None, Some(PORT_ADISC), deadline)? {
                if resp.is_error_response() {
                    continue;
                }
                nodes.push(NodeInfo {
                    addr: resp.data[ADISC_RESP_DATA_SOFT_ADDR],
                    id_msw,
                    id_lsw: adisc_resp_id(&resp),
                    product_id: None,
                });
            }
        }
        log::debug!("adisc stage 2: {} nodes", nodes.len());
        Ok(nodes)
    }

    /// Run the two-stage probe. The result is the node inventory,
    /// sorted by id, without product strings.
    pub fn adisc(&mut self, mode: AdiscMode, addr: u8) -> io::Result<Vec<NodeInfo>> {
        if mode == AdiscMode::Reset {
            // Arbitration can eat broadcasts on a contended bus, so
            // the reset goes out a few times.
            for _ in 0..3 {
                self.adisc_unassign(ADDR_BROADCAST)?;
            }
        }

        let mut msw_ids = self.adisc_stage1(addr, ADISC_TIMEOUT * 4)?;
        if msw_ids.is_empty() {
            log::warn!("no responses at stage 1, trying again");
            msw_ids = self.adisc_stage1(addr, ADISC_TIMEOUT * 4)?;
        }
        if msw_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut nodes = self.adisc_stage2(addr, &msw_ids, ADISC_TIMEOUT * 2)?;
        nodes.sort_by(|a, b| (a.id_msw, a.id_lsw).cmp(&(b.id_msw, b.id_lsw)));
        Ok(nodes)
    }

    /// Claim one node for `info.addr`: shortlist it by high half, then
    /// assign by low half under the shortlist predicate.
    fn assign(&mut self, info: &NodeInfo) -> io::Result<bool> {
        let dst = ADDR_UNASSIGNED;

        self.clear_shortlist(ADDR_BROADCAST)?;
        self.clear_shortlist(ADDR_BROADCAST)?;

        let select = adisc_data(
            AdiscFlags::MATCH_ID | AdiscFlags::MATCH_ID_MSW | AdiscFlags::SET_SHORTLIST,
            0,
            info.id_msw,
        );
        for _ in 0..2 {
            self.request(dst, PORT_ADISC, &select)?;
            thread::sleep(ADISC_SETTLE);
        }

        let claim = adisc_data(
            AdiscFlags::MATCH_ID
                | AdiscFlags::MATCH_SHORTLIST
                | AdiscFlags::ASSIGN_ADDR
                | AdiscFlags::RETURN_ID,
            info.addr,
            info.id_lsw,
        );
        for _ in 0..3 {
            self.request(dst, PORT_ADISC, &claim)?;
            if let Some(resp) = self.wait_response_from(Some(dst), Some(PORT_ADISC), ADISC_TIMEOUT)?
            {
                if !resp.is_error_response()
                    && adisc_resp_id(&resp) == info.id_lsw
                    && resp.data[ADISC_RESP_DATA_SOFT_ADDR] == info.addr
                {
                    self.clear_shortlist(info.addr)?;
                    return Ok(true);
                }
            }
        }
        log::warn!("assignment failed for {}", info.id_string());
        Ok(false)
    }

    /// Full rediscover plus auto-assignment of every unassigned node.
    /// Running out of addresses leaves the remainder at 63; that is
    /// reported, not fatal.
    pub fn adisc_and_assign(&mut self) -> io::Result<Vec<NodeInfo>> {
        let mut nodes = self.adisc(AdiscMode::Refresh, ADDR_BROADCAST)?;
        for i in 0..nodes.len() {
            if nodes[i].addr != ADDR_UNASSIGNED {
                continue;
            }
            match lowest_free_addr(&nodes) {
                Some(addr) => {
                    nodes[i].addr = addr;
                    let info = nodes[i].clone();
                    if !self.assign(&info)? {
                        nodes[i].addr = ADDR_UNASSIGNED;
                    }
                }
                None => {
                    log::warn!("ran out of addresses");
                    break;
                }
            }
        }
        self.get_product_ids(&mut nodes)?;
        Ok(nodes)
    }

    /// Fill in product-id strings for an inventory, one retry each.
    pub fn get_product_ids(&mut self, nodes: &mut [NodeInfo]) -> io::Result<()> {
        let cmd = GlobalConf::ProductIdStr as u8;
        for node in nodes.iter_mut() {
            if node.addr == ADDR_UNASSIGNED {
                continue;
            }
            let mut product = self.get_conf_string(node.addr, cmd, 0)?;
            if product.is_none() {
                product = self.get_conf_string(node.addr, cmd, 0)?;
            }
            if product.is_none() {
                log::warn!("couldn't get product id for {}", node.id_string());
            }
            node.product_id = product;
        }
        Ok(())
    }

    /// Describe one node by address: both id halves plus its product
    /// string. `Ok(None)` is a timeout.
    pub fn node_info(&mut self, addr: u8) -> io::Result<Option<NodeInfo>> {
        let probe = adisc_data(AdiscFlags::RETURN_ID | AdiscFlags::RETURN_ID_MSW, 0, 0);
        self.request(addr, PORT_ADISC, &probe[..2])?;
        let id_msw = match self.wait_response_from(Some(addr), Some(PORT_ADISC), self.timeout)? {
            Some(resp) if !resp.is_error_response() => adisc_resp_id(&resp),
            _ => return Ok(None),
        };

        let probe = adisc_data(AdiscFlags::RETURN_ID, 0, 0);
        self.request(addr, PORT_ADISC, &probe[..2])?;
        let id_lsw = match self.wait_response_from(Some(addr), Some(PORT_ADISC), self.timeout)? {
            Some(resp) if !resp.is_error_response() => adisc_resp_id(&resp),
            _ => return Ok(None),
        };

        let product_id = self.get_conf_string(addr, GlobalConf::ProductIdStr as u8, 0)?;
        Ok(Some(NodeInfo {
            addr,
            id_msw,
            id_lsw,
            product_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(addr: u8, id: u64) -> NodeInfo {
        NodeInfo {
            addr,
            id_msw: id >> 24,
            id_lsw: id & 0xff_ffff,
            product_id: None,
        }
    }

    #[test]
    fn lowest_free_skips_taken_addresses() {
        let nodes = vec![info(1, 1), info(2, 2), info(ADDR_UNASSIGNED, 3)];
        assert_eq!(lowest_free_addr(&nodes), Some(3));
        assert_eq!(lowest_free_addr(&[]), Some(1));
    }

    #[test]
    fn address_space_can_run_out() {
        let nodes: Vec<NodeInfo> = (ASSIGN_FIRST..=ASSIGN_LAST).map(|a| info(a, a as u64)).collect();
        assert_eq!(lowest_free_addr(&nodes), None);
    }

    #[test]
    fn node_json_embeds_product_descriptor() {
        let mut n = info(5, 0x123456);
        n.product_id = Some("{\"id\":\"TBG-INPUT\",\"rev\":3}".to_string());
        let v = n.to_json();
        assert_eq!(v["addr"], 5);
        assert_eq!(v["product"]["id"], "TBG-INPUT");
        assert!(v["id"].as_str().unwrap().starts_with("0x"));
    }
}
