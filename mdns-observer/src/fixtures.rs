//! Packet builders for tests.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::{A, AAAA, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record};

pub(crate) fn peer() -> SocketAddr {
    "192.168.1.50:5353".parse().unwrap()
}

pub(crate) struct Packet {
    message: Message,
}

impl Packet {
    pub(crate) fn response() -> Self {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response).set_authoritative(true);
        Self { message }
    }

    fn record(name: &str, ttl: u32, rdata: RData, cache_flush: bool) -> Record {
        let mut record = Record::from_rdata(Name::from_ascii(format!("{name}.")).unwrap(), ttl, rdata);
        record.set_mdns_cache_flush(cache_flush);
        record
    }

    fn srv_data(target: &str, port: u16) -> RData {
        RData::SRV(SRV::new(0, 0, port, Name::from_ascii(format!("{target}.")).unwrap()))
    }

    fn answer(mut self, record: Record) -> Self {
        self.message.add_answer(record);
        self
    }

    pub(crate) fn srv(self, name: &str, ttl: u32, target: &str, port: u16) -> Self {
        self.answer(Self::record(name, ttl, Self::srv_data(target, port), true))
    }

    pub(crate) fn srv_goodbye(self, name: &str, target: &str, port: u16) -> Self {
        self.answer(Self::record(name, 0, Self::srv_data(target, port), true))
    }

    pub(crate) fn txt(self, name: &str, ttl: u32, strings: &[&str]) -> Self {
        let txt = TXT::new(strings.iter().map(|s| s.to_string()).collect());
        self.answer(Self::record(name, ttl, RData::TXT(txt), true))
    }

    pub(crate) fn a(self, name: &str, ttl: u32, ip: &str) -> Self {
        let ip: Ipv4Addr = ip.parse().unwrap();
        self.answer(Self::record(name, ttl, RData::A(A(ip)), true))
    }

    pub(crate) fn aaaa(self, name: &str, ttl: u32, ip: &str) -> Self {
        let ip: Ipv6Addr = ip.parse().unwrap();
        self.answer(Self::record(name, ttl, RData::AAAA(AAAA(ip)), true))
    }

    pub(crate) fn a_goodbye(self, name: &str, ip: &str) -> Self {
        let ip: Ipv4Addr = ip.parse().unwrap();
        self.answer(Self::record(name, 0, RData::A(A(ip)), true))
    }

    /// TTL 0 without the cache-flush bit; not a goodbye
    pub(crate) fn a_zero_ttl(self, name: &str, ip: &str) -> Self {
        let ip: Ipv4Addr = ip.parse().unwrap();
        self.answer(Self::record(name, 0, RData::A(A(ip)), false))
    }

    pub(crate) fn additional_a(mut self, name: &str, ttl: u32, ip: &str) -> Self {
        let ip: Ipv4Addr = ip.parse().unwrap();
        self.message.add_additional(Self::record(name, ttl, RData::A(A(ip)), true));
        self
    }

    /// Distinguishes otherwise identical packets
    pub(crate) fn id(mut self, id: u16) -> Self {
        self.message.set_id(id);
        self
    }

    pub(crate) fn bytes(&self) -> Vec<u8> {
        self.message.to_vec().unwrap()
    }
}
