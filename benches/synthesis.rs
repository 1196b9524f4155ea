use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use research_flow::models::{EngineId, SearchResult, SearchResultWithEngine};
use research_flow::research::{
    apply_practical_weighting, calculate_practical_comprehensiveness, deduplicate,
};

const SNIPPETS: [&str; 4] = [
    "A step by step tutorial with a practical example you can follow",
    "Peer reviewed study of the underlying mechanism",
    "Community discussion and tips from people who tried it",
    "Overview of the topic with history and context",
];

fn generated_results(count: usize) -> Vec<SearchResultWithEngine> {
    (0..count)
        .map(|i| {
            let engine = EngineId::ALL[i % EngineId::ALL.len()];
            // Every third result repeats an earlier url so dedup has work to do.
            let key = if i % 3 == 0 { i / 3 } else { i };
            SearchResultWithEngine::new(
                SearchResult {
                    id: format!("r{}", i),
                    title: format!("Result {} about photosynthesis", key),
                    url: format!("https://example.com/{}", key),
                    snippet: SNIPPETS[i % SNIPPETS.len()].to_string(),
                    relevance_score: (i % 10) as f64 / 10.0,
                },
                engine,
                "generated",
            )
        })
        .collect()
}

fn bench_weighting(c: &mut Criterion) {
    let results = generated_results(200);

    c.bench_function("practical_weighting_200", |b| {
        b.iter_batched(
            || results.clone(),
            |mut batch| apply_practical_weighting(black_box(&mut batch)),
            BatchSize::SmallInput,
        )
    });

    c.bench_function("practical_comprehensiveness_200", |b| {
        b.iter(|| calculate_practical_comprehensiveness(black_box(&results)))
    });
}

fn bench_deduplicate(c: &mut Criterion) {
    let results = generated_results(500);

    c.bench_function("deduplicate_500", |b| {
        b.iter_batched(
            || results.clone(),
            |batch| deduplicate(black_box(batch)),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_weighting, bench_deduplicate);
criterion_main!(benches);
