//! RTCP compound codec for the packet types the server dispatches.

use bytes::Bytes;
use shared::buffer::{BytesReader, BytesWriter};
use shared::error::{Error, Result};

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;
pub const PT_XR: u8 = 207;

pub const RTPFB_FMT_NACK: u8 = 1;
pub const RTPFB_FMT_TWCC: u8 = 15;
pub const PSFB_FMT_PLI: u8 = 1;
pub const PSFB_FMT_FIR: u8 = 4;

const XR_BLOCK_RRTR: u8 = 4;
const XR_BLOCK_DLRR: u8 = 5;

/// Whether a datagram that already matched the RTP version bits is RTCP
/// rather than RTP, judged by the payload-type byte.
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && (192..=223).contains(&data[1])
}

/// One reception report block as carried in SR/RR.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub total_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport {
        ssrc: u32,
        ntp: u64,
        rtp_time: u32,
        packet_count: u32,
        octet_count: u32,
        reports: Vec<ReportBlock>,
    },
    ReceiverReport {
        ssrc: u32,
        reports: Vec<ReportBlock>,
    },
    /// CNAME-only source description.
    SourceDescription {
        chunks: Vec<(u32, String)>,
    },
    Bye {
        ssrcs: Vec<u32>,
    },
    Nack {
        sender_ssrc: u32,
        media_ssrc: u32,
        pairs: Vec<(u16, u16)>,
    },
    Pli {
        sender_ssrc: u32,
        media_ssrc: u32,
    },
    Fir {
        sender_ssrc: u32,
        media_ssrc: u32,
        seq: u8,
    },
    /// Receiver reference time report.
    XrRrtr {
        ssrc: u32,
        ntp: u64,
    },
    /// Delay since last RR, the answer half of the RRTR exchange.
    XrDlrr {
        ssrc: u32,
        blocks: Vec<(u32, u32, u32)>,
    },
    /// Anything we carry but do not interpret (APP, TWCC feedback inbound).
    Other {
        payload_type: u8,
        fmt: u8,
        payload: Bytes,
    },
}

/// Splits a compound buffer at each RTCP header boundary and parses every
/// packet.
pub fn unmarshal_compound(data: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut out = Vec::new();
    let mut r = BytesReader::new(data);
    while r.remaining() >= 4 {
        let b0 = r.read_u8()?;
        if b0 >> 6 != 2 {
            return Err(Error::RtcpDecode("bad version".into()));
        }
        let fmt = b0 & 0x1F;
        let pt = r.read_u8()?;
        let words = r.read_u16()? as usize;
        let body = r.read_slice(words * 4)?;
        out.push(parse_one(pt, fmt, body)?);
    }
    Ok(out)
}

fn parse_one(pt: u8, fmt: u8, body: &[u8]) -> Result<RtcpPacket> {
    let mut r = BytesReader::new(body);
    match pt {
        PT_SR => {
            let ssrc = r.read_u32()?;
            let ntp = r.read_u64()?;
            let rtp_time = r.read_u32()?;
            let packet_count = r.read_u32()?;
            let octet_count = r.read_u32()?;
            let reports = parse_report_blocks(&mut r, fmt as usize)?;
            Ok(RtcpPacket::SenderReport {
                ssrc,
                ntp,
                rtp_time,
                packet_count,
                octet_count,
                reports,
            })
        }
        PT_RR => {
            let ssrc = r.read_u32()?;
            let reports = parse_report_blocks(&mut r, fmt as usize)?;
            Ok(RtcpPacket::ReceiverReport { ssrc, reports })
        }
        PT_SDES => {
            let mut chunks = Vec::new();
            for _ in 0..fmt {
                let ssrc = r.read_u32()?;
                let mut cname = String::new();
                loop {
                    let item = r.read_u8()?;
                    if item == 0 {
                        break;
                    }
                    let len = r.read_u8()? as usize;
                    let text = r.read_slice(len)?;
                    if item == 1 {
                        cname = String::from_utf8_lossy(text).into_owned();
                    }
                }
                // chunk padding to a word boundary
                while r.pos() % 4 != 0 {
                    r.read_u8()?;
                }
                chunks.push((ssrc, cname));
            }
            Ok(RtcpPacket::SourceDescription { chunks })
        }
        PT_BYE => {
            let mut ssrcs = Vec::new();
            for _ in 0..fmt {
                ssrcs.push(r.read_u32()?);
            }
            Ok(RtcpPacket::Bye { ssrcs })
        }
        PT_RTPFB if fmt == RTPFB_FMT_NACK => {
            let sender_ssrc = r.read_u32()?;
            let media_ssrc = r.read_u32()?;
            let mut pairs = Vec::new();
            while r.remaining() >= 4 {
                pairs.push((r.read_u16()?, r.read_u16()?));
            }
            Ok(RtcpPacket::Nack {
                sender_ssrc,
                media_ssrc,
                pairs,
            })
        }
        PT_PSFB if fmt == PSFB_FMT_PLI => Ok(RtcpPacket::Pli {
            sender_ssrc: r.read_u32()?,
            media_ssrc: r.read_u32()?,
        }),
        PT_PSFB if fmt == PSFB_FMT_FIR => {
            let sender_ssrc = r.read_u32()?;
            let _media_unused = r.read_u32()?;
            let media_ssrc = r.read_u32()?;
            let seq = r.read_u8()?;
            Ok(RtcpPacket::Fir {
                sender_ssrc,
                media_ssrc,
                seq,
            })
        }
        PT_XR => {
            let ssrc = r.read_u32()?;
            while r.remaining() >= 4 {
                let bt = r.read_u8()?;
                let _reserved = r.read_u8()?;
                let words = r.read_u16()? as usize;
                let block = r.read_slice(words * 4)?;
                match bt {
                    XR_BLOCK_RRTR => {
                        let mut br = BytesReader::new(block);
                        return Ok(RtcpPacket::XrRrtr {
                            ssrc,
                            ntp: br.read_u64()?,
                        });
                    }
                    XR_BLOCK_DLRR => {
                        let mut br = BytesReader::new(block);
                        let mut blocks = Vec::new();
                        while br.remaining() >= 12 {
                            blocks.push((br.read_u32()?, br.read_u32()?, br.read_u32()?));
                        }
                        return Ok(RtcpPacket::XrDlrr { ssrc, blocks });
                    }
                    _ => continue,
                }
            }
            Ok(RtcpPacket::Other {
                payload_type: pt,
                fmt,
                payload: Bytes::copy_from_slice(body),
            })
        }
        _ => Ok(RtcpPacket::Other {
            payload_type: pt,
            fmt,
            payload: Bytes::copy_from_slice(body),
        }),
    }
}

fn parse_report_blocks(r: &mut BytesReader<'_>, count: usize) -> Result<Vec<ReportBlock>> {
    let mut reports = Vec::with_capacity(count);
    for _ in 0..count {
        reports.push(ReportBlock {
            ssrc: r.read_u32()?,
            fraction_lost: r.read_u8()?,
            total_lost: r.read_u24()?,
            highest_seq: r.read_u32()?,
            jitter: r.read_u32()?,
            last_sr: r.read_u32()?,
            delay_since_last_sr: r.read_u32()?,
        });
    }
    Ok(reports)
}

impl RtcpPacket {
    pub fn marshal(&self) -> Bytes {
        let mut body = BytesWriter::new();
        let (pt, fmt) = match self {
            RtcpPacket::SenderReport {
                ssrc,
                ntp,
                rtp_time,
                packet_count,
                octet_count,
                reports,
            } => {
                body.write_u32(*ssrc);
                body.write_u64(*ntp);
                body.write_u32(*rtp_time);
                body.write_u32(*packet_count);
                body.write_u32(*octet_count);
                write_report_blocks(&mut body, reports);
                (PT_SR, reports.len() as u8)
            }
            RtcpPacket::ReceiverReport { ssrc, reports } => {
                body.write_u32(*ssrc);
                write_report_blocks(&mut body, reports);
                (PT_RR, reports.len() as u8)
            }
            RtcpPacket::SourceDescription { chunks } => {
                for (ssrc, cname) in chunks {
                    body.write_u32(*ssrc);
                    body.write_u8(1);
                    body.write_u8(cname.len() as u8);
                    body.write_slice(cname.as_bytes());
                    body.write_u8(0);
                    while body.len() % 4 != 0 {
                        body.write_u8(0);
                    }
                }
                (PT_SDES, chunks.len() as u8)
            }
            RtcpPacket::Bye { ssrcs } => {
                for s in ssrcs {
                    body.write_u32(*s);
                }
                (PT_BYE, ssrcs.len() as u8)
            }
            RtcpPacket::Nack {
                sender_ssrc,
                media_ssrc,
                pairs,
            } => {
                body.write_u32(*sender_ssrc);
                body.write_u32(*media_ssrc);
                for (pid, blp) in pairs {
                    body.write_u16(*pid);
                    body.write_u16(*blp);
                }
                (PT_RTPFB, RTPFB_FMT_NACK)
            }
            RtcpPacket::Pli {
                sender_ssrc,
                media_ssrc,
            } => {
                body.write_u32(*sender_ssrc);
                body.write_u32(*media_ssrc);
                (PT_PSFB, PSFB_FMT_PLI)
            }
            RtcpPacket::Fir {
                sender_ssrc,
                media_ssrc,
                seq,
            } => {
                body.write_u32(*sender_ssrc);
                body.write_u32(0);
                body.write_u32(*media_ssrc);
                body.write_u8(*seq);
                body.write_u24(0);
                (PT_PSFB, PSFB_FMT_FIR)
            }
            RtcpPacket::XrRrtr { ssrc, ntp } => {
                body.write_u32(*ssrc);
                body.write_u8(XR_BLOCK_RRTR);
                body.write_u8(0);
                body.write_u16(2);
                body.write_u64(*ntp);
                (PT_XR, 0)
            }
            RtcpPacket::XrDlrr { ssrc, blocks } => {
                body.write_u32(*ssrc);
                body.write_u8(XR_BLOCK_DLRR);
                body.write_u8(0);
                body.write_u16((blocks.len() * 3) as u16);
                for (s, lrr, dlrr) in blocks {
                    body.write_u32(*s);
                    body.write_u32(*lrr);
                    body.write_u32(*dlrr);
                }
                (PT_XR, 0)
            }
            RtcpPacket::Other {
                payload_type,
                fmt,
                payload,
            } => {
                body.write_slice(payload);
                (*payload_type, *fmt)
            }
        };
        let body = body.freeze();
        debug_assert_eq!(body.len() % 4, 0);

        let mut w = BytesWriter::with_capacity(4 + body.len());
        w.write_u8(0x80 | (fmt & 0x1F));
        w.write_u8(pt);
        w.write_u16((body.len() / 4) as u16);
        w.write_slice(&body);
        w.freeze()
    }
}

/// Concatenates packets into one compound datagram.
pub fn marshal_compound(packets: &[RtcpPacket]) -> Bytes {
    let mut w = BytesWriter::new();
    for p in packets {
        w.write_slice(&p.marshal());
    }
    w.freeze()
}

fn write_report_blocks(w: &mut BytesWriter, reports: &[ReportBlock]) {
    for b in reports {
        w.write_u32(b.ssrc);
        w.write_u8(b.fraction_lost);
        w.write_u24(b.total_lost);
        w.write_u32(b.highest_seq);
        w.write_u32(b.jitter);
        w.write_u32(b.last_sr);
        w.write_u32(b.delay_since_last_sr);
    }
}
