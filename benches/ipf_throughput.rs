use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use countyfit::data::{CellKey, CellTable, YearPartition};
use countyfit::fitting::fit_partition;
use countyfit::margins::{InsurerCountyIndex, MarginRow, MetalCountyIndex};
use countyfit::tier::MetalTier;
use countyfit::IpfOptions;

const YEAR: i32 = 2020;

struct Fixture {
    partition: YearPartition,
    insurer_margins: InsurerCountyIndex,
    metal_margins: MetalCountyIndex,
}

/// Random positive cells over `counties` × 8 insurers × 4 plans × every tier,
/// with control totals drawn from a perturbed copy of the seed.
fn fixture(counties: usize, seed: u64) -> Fixture {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut keys = Vec::new();
    let mut values = Vec::new();
    let mut insurer_rows = Vec::new();
    let mut metal_rows = Vec::new();

    for county in 0..counties {
        let county_name = format!("COUNTY {county}");
        for insurer in 0..8 {
            for plan in 0..4 {
                for tier in MetalTier::ALL {
                    let value: f64 = rng.gen_range(1.0..500.0);
                    keys.push(CellKey {
                        year: YEAR,
                        county: county_name.clone(),
                        rating_area: (county / 3) as u32,
                        insurer: format!("INSURER {insurer}"),
                        plan: format!("PLAN {plan}"),
                        metal_tier: tier,
                    });
                    values.push(value);

                    let target = value * rng.gen_range(0.8..1.2);
                    let name = format!("INSURER {insurer}");
                    insurer_rows.push(MarginRow::new(YEAR, name, county_name.clone(), target));
                    metal_rows.push(MarginRow::new(YEAR, tier, county_name.clone(), target));
                }
            }
        }
    }

    let cells = CellTable::new(keys, values).expect("positive estimates");
    Fixture {
        partition: YearPartition::new(YEAR, cells).expect("single year"),
        insurer_margins: InsurerCountyIndex::build(YEAR, &insurer_rows).expect("valid targets"),
        metal_margins: MetalCountyIndex::build(YEAR, &metal_rows).expect("valid targets"),
    }
}

fn bench_fit_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("fit_partition");
    let options = IpfOptions::default();
    for &counties in &[10usize, 58, 200] {
        let fixture = fixture(counties, 42);
        group.throughput(Throughput::Elements(fixture.partition.cells().len() as u64));
        let id = BenchmarkId::from_parameter(counties);
        group.bench_with_input(id, &fixture, |b, fixture| {
            b.iter_batched(
                || fixture.partition.clone(),
                |mut partition| {
                    fit_partition(
                        &mut partition,
                        &fixture.insurer_margins,
                        &fixture.metal_margins,
                        &options,
                    )
                    .expect("fit succeeds")
                },
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fit_partition);
criterion_main!(benches);
