//! End-to-end codec scenarios.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::wire::deserialize_recovery_footer;
use crate::{Decoder, Encoder, Error};

fn random_payloads(count: usize, bytes: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let mut payload = vec![0u8; bytes];
            rng.fill_bytes(&mut payload);
            payload
        })
        .collect()
}

#[test]
fn test_no_loss_baseline() {
    let payloads = random_payloads(10, 1024, 1);
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    for payload in &payloads {
        let column = encoder.add(payload).unwrap();
        decoder.add_original(column, payload).unwrap();
    }

    // Nothing is missing, so there is nothing to decode.
    assert!(!decoder.is_ready());
    assert_eq!(decoder.decode().unwrap_err(), Error::NeedMoreData);

    for (column, payload) in payloads.iter().enumerate() {
        assert_eq!(decoder.get(column as u32).unwrap(), &payload[..]);
    }
}

#[test]
fn test_single_loss_recovered_by_parity() {
    let payloads = random_payloads(8, 512, 2);
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    for (i, payload) in payloads.iter().enumerate() {
        let column = encoder.add(payload).unwrap();
        if i < 7 {
            decoder.add_original(column, payload).unwrap();
        }
    }

    let recovery = encoder.encode().unwrap().to_vec();
    let (metadata, _) = deserialize_recovery_footer(&recovery).unwrap();
    assert_eq!(metadata.row, 0); // parity

    decoder.add_recovery(&recovery).unwrap();
    assert!(decoder.is_ready());

    let recovered = decoder.decode().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].packet_num, 7);
    assert_eq!(recovered[0].data, payloads[7]);

    // The recovered packet is also retrievable from the window.
    assert_eq!(decoder.get(7).unwrap(), &payloads[7][..]);
}

#[test]
fn test_burst_loss_recovered_by_structured_rows() {
    let payloads = random_payloads(1000, 1200, 3);
    let lost: &[u32] = &[100, 101, 102, 500, 501];

    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    for (i, payload) in payloads.iter().enumerate() {
        let column = encoder.add(payload).unwrap();
        assert_eq!(column, i as u32);
        if !lost.contains(&column) {
            decoder.add_original(column, payload).unwrap();
        }
    }

    // One recovery per loss; the structured regime may very rarely produce
    // a dependent row, in which case one more covers it.
    for _ in 0..lost.len() {
        let recovery = encoder.encode().unwrap().to_vec();
        let (metadata, _) = deserialize_recovery_footer(&recovery).unwrap();
        assert_eq!(metadata.sum_count, 1000);
        assert_eq!(metadata.ldpc_count, 1000);
        decoder.add_recovery(&recovery).unwrap();
    }
    let mut extra = 0;
    while !decoder.is_ready() {
        extra += 1;
        assert!(extra <= 3, "recovery never became solvable");
        let recovery = encoder.encode().unwrap().to_vec();
        decoder.add_recovery(&recovery).unwrap();
    }

    let recovered = decoder.decode().unwrap();
    assert_eq!(recovered.len(), lost.len());
    for (packet, &column) in recovered.iter().zip(lost) {
        assert_eq!(packet.packet_num, column);
        assert_eq!(packet.data, payloads[column as usize]);
    }

    // Late arrival of an already recovered original is a duplicate.
    assert_eq!(
        decoder.add_original(100, &payloads[100]).unwrap_err(),
        Error::DuplicateData
    );
}

#[test]
fn test_ack_driven_retransmit() {
    let mut encoder = Encoder::new();
    for i in 0..50 {
        encoder.add(&vec![i as u8; 80]).unwrap();
    }

    // Ack: next expected 10, missing {15, 16}.
    let mut ack = [0u8; 32];
    let mut used = crate::wire::serialize_packet_num(10, &mut ack);
    used += crate::wire::serialize_nack_range(5, 1, &mut ack[used..]);
    encoder.acknowledge(&ack[..used]).unwrap();

    let (column, payload) = encoder.retransmit(0).unwrap();
    assert_eq!(column, 15);
    assert_eq!(payload, &[15u8; 80][..]);

    let (column, payload) = encoder.retransmit(0).unwrap();
    assert_eq!(column, 16);
    assert_eq!(payload, &[16u8; 80][..]);

    assert_eq!(encoder.retransmit(0).unwrap_err(), Error::NeedMoreData);

    // Acked data is gone, NACKed data is still held.
    assert_eq!(encoder.get(9).unwrap_err(), Error::NeedMoreData);
    assert_eq!(encoder.get(15).unwrap(), &[15u8; 80][..]);
}

#[test]
fn test_ack_roundtrip_between_codecs() {
    let payloads = random_payloads(30, 200, 4);
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    for (i, payload) in payloads.iter().enumerate() {
        let column = encoder.add(payload).unwrap();
        if !(10..12).contains(&i) {
            decoder.add_original(column, payload).unwrap();
        }
    }

    let mut ack = [0u8; 64];
    let used = decoder.acknowledgement(&mut ack, 0).unwrap();
    encoder.acknowledge(&ack[..used]).unwrap();

    // The encoder trimmed to the decoder's next expected column and can
    // retransmit exactly the reported losses.
    let (column, payload) = encoder.retransmit(0).unwrap();
    assert_eq!(column, 10);
    assert_eq!(payload, &payloads[10][..]);
    let (column, _) = encoder.retransmit(0).unwrap();
    assert_eq!(column, 11);
    assert_eq!(encoder.retransmit(0).unwrap_err(), Error::NeedMoreData);
    assert_eq!(encoder.get(5).unwrap_err(), Error::NeedMoreData);

    // Deliver the retransmits; the next ack reports nothing missing.
    decoder.add_original(10, &payloads[10]).unwrap();
    decoder.add_original(11, &payloads[11]).unwrap();
    let used = decoder.acknowledgement(&mut ack, 0).unwrap();
    let (next_expected, consumed) = crate::wire::deserialize_packet_num(&ack[..used]).unwrap();
    assert_eq!(next_expected, 30);
    assert_eq!(consumed, used);
}

#[test]
fn test_window_trim() {
    let mut encoder = Encoder::new();
    for i in 0..=200u32 {
        encoder.add(&vec![(i % 256) as u8; 64]).unwrap();
    }

    encoder.remove_before(64).unwrap();
    assert_eq!(encoder.get(63).unwrap_err(), Error::NeedMoreData);
    assert_eq!(encoder.get(64).unwrap(), &[64u8; 64][..]);
}

#[test]
fn test_remove_before_future_column_restarts_window() {
    let mut encoder = Encoder::new();
    for i in 0..10u32 {
        encoder.add(&vec![i as u8; 32]).unwrap();
    }

    encoder.remove_before(5000).unwrap();
    assert_eq!(encoder.encode().unwrap_err(), Error::NeedMoreData);

    // The numbering continues where it left off.
    let column = encoder.add(&[0xfe; 32]).unwrap();
    assert_eq!(column, 10);
    assert_eq!(encoder.get(10).unwrap(), &[0xfe; 32][..]);
}

#[test]
fn test_oom_latches_every_entry_point() {
    let mut encoder = Encoder::new();
    encoder.set_memory_limit(Some(encoder.stats().memory_allocated_bytes as usize));

    let mut disabled_at = None;
    for i in 0..10_000usize {
        match encoder.add(&[0x42u8; 1000]) {
            Ok(_) => {}
            Err(Error::Disabled) => {
                disabled_at = Some(i);
                break;
            }
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert!(disabled_at.is_some(), "allocation failure never hit");

    // Terminal: every call keeps failing, with no panic.
    assert_eq!(encoder.add(&[1u8; 8]).unwrap_err(), Error::Disabled);
    assert_eq!(encoder.encode().unwrap_err(), Error::Disabled);
    assert_eq!(encoder.retransmit(0).unwrap_err(), Error::Disabled);
    assert_eq!(encoder.acknowledge(&[0]).unwrap_err(), Error::Disabled);
    assert_eq!(encoder.get(0).unwrap_err(), Error::Disabled);
}

#[test]
fn test_packet_number_wraparound() {
    let start = crate::PACKET_NUM_COUNT - 8;
    let payloads = random_payloads(16, 256, 5);

    let mut encoder = Encoder::new();
    encoder.set_next_column(start);
    let mut decoder = Decoder::new();

    let mut columns = Vec::new();
    for (i, payload) in payloads.iter().enumerate() {
        let column = encoder.add(payload).unwrap();
        columns.push(column);
        // Columns wrap through zero after eight adds.
        assert_eq!(column, (start + i as u32) & crate::PACKET_NUM_MAX);
        if i != 12 {
            decoder.add_original(column, payload).unwrap();
        }
    }
    assert_eq!(columns[8], 0);

    let recovery = encoder.encode().unwrap().to_vec();
    decoder.add_recovery(&recovery).unwrap();
    assert!(decoder.is_ready());

    let recovered = decoder.decode().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].packet_num, columns[12]);
    assert_eq!(recovered[0].data, payloads[12]);
}

#[test]
fn test_window_shrink_switches_back_to_cauchy() {
    let mut encoder = Encoder::new();
    for i in 0..100u32 {
        encoder.add(&vec![(i % 256) as u8; 128]).unwrap();
    }

    // Large window: structured rows with running sums.
    let recovery = encoder.encode().unwrap().to_vec();
    let (metadata, _) = deserialize_recovery_footer(&recovery).unwrap();
    assert!(metadata.sum_count as usize > crate::CAUCHY_THRESHOLD);

    // Acknowledge most of the window; the unacknowledged count drops to
    // the Cauchy regime and the sums are abandoned.
    let mut ack = [0u8; 16];
    let used = crate::wire::serialize_packet_num(80, &mut ack);
    encoder.acknowledge(&ack[..used]).unwrap();

    let recovery = encoder.encode().unwrap().to_vec();
    let (metadata, _) = deserialize_recovery_footer(&recovery).unwrap();
    assert_eq!(metadata.sum_count, 20);
    assert_eq!(metadata.column_start, 80);
}

#[test]
fn test_interleaved_loss_with_multiple_recoveries() {
    let payloads = random_payloads(40, 300, 6);
    let lost: &[u32] = &[3, 17, 31];

    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    for payload in &payloads {
        let column = encoder.add(payload).unwrap();
        if !lost.contains(&column) {
            decoder.add_original(column, payload).unwrap();
        }
    }

    // Cauchy regime: exactly as many recoveries as losses must suffice.
    for _ in 0..lost.len() {
        let recovery = encoder.encode().unwrap().to_vec();
        decoder.add_recovery(&recovery).unwrap();
    }

    assert!(decoder.is_ready());
    let recovered = decoder.decode().unwrap();
    assert_eq!(recovered.len(), lost.len());
    for (packet, &column) in recovered.iter().zip(lost) {
        assert_eq!(packet.packet_num, column);
        assert_eq!(packet.data, payloads[column as usize]);
    }

    let stats = decoder.stats();
    assert_eq!(stats.solve_success_count, lost.len() as u64);
    assert_eq!(stats.solve_fail_count, 0);
}

#[test]
fn test_duplicate_recovery_is_counted_not_fatal() {
    let payloads = random_payloads(8, 100, 7);
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    for payload in &payloads {
        let column = encoder.add(payload).unwrap();
        decoder.add_original(column, payload).unwrap();
    }

    // Everything arrived; the recovery is redundant.
    let recovery = encoder.encode().unwrap().to_vec();
    decoder.add_recovery(&recovery).unwrap();
    assert_eq!(decoder.stats().duped_recovery_count, 1);
    assert!(!decoder.is_ready());
}

#[test]
fn test_streaming_loss_with_periodic_recovery() {
    // Steady 10% loss repaired on the fly, a window at a time.
    let payloads = random_payloads(300, 150, 8);
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    let mut delivered = 0usize;
    for (i, payload) in payloads.iter().enumerate() {
        let column = encoder.add(payload).unwrap();
        if i % 10 != 7 {
            decoder.add_original(column, payload).unwrap();
        }

        // A recovery packet every eight originals.
        if i % 8 == 7 {
            let recovery = encoder.encode().unwrap().to_vec();
            decoder.add_recovery(&recovery).unwrap();
            while decoder.is_ready() {
                delivered += decoder.decode().unwrap().len();
            }
        }
    }

    // Every payload is available at the decoder by the end.
    let mut missing = 0;
    for (i, payload) in payloads.iter().enumerate() {
        match decoder.get(i as u32) {
            Ok(data) => assert_eq!(data, &payload[..]),
            Err(_) => missing += 1,
        }
    }
    // The tail may still be unprotected, but everything else made it.
    assert!(missing <= 1, "{} packets missing", missing);
    assert!(delivered >= 28);
}
