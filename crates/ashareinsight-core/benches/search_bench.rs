//! AShareInsight Search Benchmarks
//!
//! Benchmarks for the vector index and the hot paths of fusion planning
//! and retrieval aggregation.
//! Run with: cargo bench -p ashareinsight-core

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;

use ashareinsight_core::domain::{
    aggregate_company, sort_companies_deterministically, AggregationStrategy, ConceptCategory,
    ConceptDetails, Document,
};
use ashareinsight_core::search::{VectorIndex, VectorIndexConfig};
use ashareinsight_core::usecases::fusion::{plan_fusion, ExtractedConcept};

fn random_vector(dims: usize, seed: usize) -> Vec<f32> {
    (0..dims).map(|j| ((seed * dims + j) as f32).sin()).collect()
}

fn bench_vector_index_insert(c: &mut Criterion) {
    c.bench_function("vector_index_insert_1000x256d", |b| {
        b.iter(|| {
            let mut index = VectorIndex::new(VectorIndexConfig {
                dimensions: 256,
                m: 16,
                ef_construction: 128,
                ef_search: 64,
            })
            .unwrap();
            for i in 0..1000 {
                index.add(Uuid::new_v4(), &random_vector(256, i)).unwrap();
            }
            black_box(&index);
        })
    });
}

fn bench_vector_index_search(c: &mut Criterion) {
    let mut index = VectorIndex::new(VectorIndexConfig {
        dimensions: 256,
        m: 16,
        ef_construction: 128,
        ef_search: 64,
    })
    .unwrap();
    for i in 0..5000 {
        index.add(Uuid::new_v4(), &random_vector(256, i)).unwrap();
    }
    let query = random_vector(256, 42);

    c.bench_function("vector_index_search_top20_of_5000", |b| {
        b.iter(|| {
            black_box(index.search_with_threshold(&query, 20, 0.0).unwrap());
        })
    });
}

fn bench_plan_fusion(c: &mut Criterion) {
    let company_id = Uuid::new_v4();
    let doc_id = Uuid::new_v4();
    let today = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
    let incoming = ExtractedConcept {
        concept_name: "螺杆空气压缩机".into(),
        concept_category: ConceptCategory::Core,
        description: "公司主营螺杆式空气压缩机的研发、生产与销售。".repeat(4),
        development_stage: "成熟".into(),
        details: ConceptDetails::default(),
        importance_score: 0.85,
    };

    c.bench_function("plan_fusion_new_concept", |b| {
        b.iter(|| {
            black_box(plan_fusion(None, &incoming, company_id, doc_id, today));
        })
    });
}

fn bench_aggregate_company(c: &mut Criterion) {
    let company_id = Uuid::new_v4();
    let docs: Vec<Document> = (0..30)
        .map(|i| Document {
            concept_id: Uuid::new_v4(),
            company_id,
            concept_name: format!("concept-{i}"),
            source_concept_id: Uuid::new_v4(),
            similarity: 1.0 - i as f32 / 30.0,
            rerank_score: Some(1.0 - i as f32 / 40.0),
            importance_score: 0.5,
            final_score: 1.0 - i as f32 / 35.0,
            evidence: None,
        })
        .collect();

    c.bench_function("aggregate_company_30_candidates", |b| {
        b.iter(|| {
            black_box(aggregate_company(
                company_id,
                "300257".into(),
                "开山股份".into(),
                docs.clone(),
                AggregationStrategy::Max,
            ));
        })
    });
}

fn bench_sort_companies(c: &mut Criterion) {
    let mut companies: Vec<_> = (0..200)
        .map(|i| {
            aggregate_company(
                Uuid::new_v4(),
                format!("{i:06}"),
                format!("Company {i}"),
                vec![],
                AggregationStrategy::Max,
            )
        })
        .collect();

    c.bench_function("sort_200_companies_deterministically", |b| {
        b.iter(|| {
            sort_companies_deterministically(&mut companies);
            black_box(&companies);
        })
    });
}

criterion_group!(
    benches,
    bench_vector_index_insert,
    bench_vector_index_search,
    bench_plan_fusion,
    bench_aggregate_company,
    bench_sort_companies,
);
criterion_main!(benches);
