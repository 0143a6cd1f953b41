use criterion::{criterion_group, criterion_main, Criterion};
use dcp_core::crypto::merkle::root_of_chunks;
use dcp_core::crypto::paillier::generate_keypair;
use dcp_core::crypto::pdp::{self, FileParams, ProofItem};
use num_bigint::{BigInt, BigUint};

fn bench_paillier(c: &mut Criterion) {
    let sk = generate_keypair(256).unwrap();
    let pk = sk.public_key();
    let m = BigUint::from(123_456_789u64);
    let ct = pk.encrypt(&m);

    c.bench_function("paillier_encrypt_256", |b| b.iter(|| pk.encrypt(&m)));
    c.bench_function("paillier_decrypt_256", |b| b.iter(|| sk.decrypt(&ct).unwrap()));
    c.bench_function("paillier_scalar_mul_256", |b| {
        b.iter(|| pk.scalar_mul(&ct, &BigInt::from(-4242)).unwrap())
    });
}

fn bench_merkle(c: &mut Criterion) {
    let data: Vec<u8> = (0..1_048_576u32).map(|i| i as u8).collect();
    c.bench_function("merkle_root_1mib_4k_chunks", |b| b.iter(|| root_of_chunks(&data, 4096)));
}

fn bench_pdp(c: &mut Criterion) {
    let keys = pdp::gen_key_pair();
    let params = FileParams::generate();
    let blobs: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 4096]).collect();
    let tags: Vec<_> = blobs
        .iter()
        .enumerate()
        .map(|(i, b)| pdp::gen_tag(&keys, &params, i as u64, 0, b).unwrap())
        .collect();
    let candidates: Vec<u64> = (0..8).collect();

    c.bench_function("pdp_gen_tag_4k", |b| {
        b.iter(|| pdp::gen_tag(&keys, &params, 0, 0, &blobs[0]).unwrap())
    });
    let challenge = pdp::gen_challenge(&keys, &params, 0, 1, &candidates, 4).unwrap();
    let items: Vec<ProofItem<'_>> = challenge
        .indices
        .iter()
        .map(|i| ProofItem {
            index: *i,
            tag: &tags[*i as usize],
            content: &blobs[*i as usize],
        })
        .collect();
    let proof = pdp::prove(&challenge, &items).unwrap();
    c.bench_function("pdp_prove_4_of_8", |b| b.iter(|| pdp::prove(&challenge, &items).unwrap()));
    c.bench_function("pdp_verify_4_of_8", |b| {
        b.iter(|| pdp::verify(&keys.public, &params, &challenge, &proof).unwrap())
    });
}

criterion_group!(benches, bench_paillier, bench_merkle, bench_pdp);
criterion_main!(benches);
