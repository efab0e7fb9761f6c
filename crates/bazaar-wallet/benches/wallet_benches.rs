//! Criterion benchmarks for wallet derivation and transaction building.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use bazaar_core::address::{Address, Network};
use bazaar_core::constants::COIN;
use bazaar_core::traits::UtxoRecord;
use bazaar_core::types::{Hash256, OutPoint, TxOutput, UtxoEntry};
use bazaar_wallet::{Seed, TransactionBuilder, WalletDeriver};

fn sample_utxos(owner: &Address, n: u8) -> Vec<UtxoRecord> {
    (0..n)
        .map(|i| UtxoRecord {
            address: owner.clone(),
            outpoint: OutPoint { txid: Hash256([i; 32]), index: 0 },
            entry: UtxoEntry {
                output: TxOutput { value: COIN, lock: owner.lock_script() },
                block_height: 1,
                is_coinbase: false,
            },
        })
        .collect()
}

fn bench_derivation(c: &mut Criterion) {
    let deriver = WalletDeriver::new(Seed::from_bytes([7; 32]), Network::Mainnet);
    let mut index = 0u32;
    c.bench_function("wallet_account_at_index", |b| {
        b.iter(|| {
            index = index.wrapping_add(1);
            black_box(deriver.wallet_account_at_index(index))
        })
    });
}

fn bench_build_and_sign(c: &mut Criterion) {
    let deriver = WalletDeriver::new(Seed::from_bytes([7; 32]), Network::Mainnet);
    let account = deriver.wallet_account_at_index(0);
    let utxos = sample_utxos(&account.address, 50);
    let dest = Address::from_pubkey_hash(Hash256([0xEE; 32]), Network::Mainnet);

    c.bench_function("build_20_input_tx", |b| {
        b.iter(|| {
            TransactionBuilder::new()
                .add_recipient(dest.clone(), 20 * COIN - COIN / 2)
                .build(black_box(&utxos), &account.address)
        })
    });

    c.bench_function("build_and_sign_sweep_50_inputs", |b| {
        b.iter(|| {
            let unsigned = TransactionBuilder::new()
                .sweep_to(dest.clone())
                .build(black_box(&utxos), &account.address)
                .unwrap();
            TransactionBuilder::sign(unsigned, &account.keypair)
        })
    });
}

criterion_group!(benches, bench_derivation, bench_build_and_sign);
criterion_main!(benches);
