//! Defragmentation Tests - Relocation Safety and Block Release
//!
//! These tests run complete begin/end pass loops and verify:
//! - Used bytes and allocation ids survive every `Copy`
//! - Live allocations never overlap after a pass
//! - Trailing blocks empty out and their heaps are released
//! - Placed resources follow their allocation
//!
//! ============================================================================
//! EACH TEST FINDS SPECIFIC BUGS - DO NOT WEAKEN ASSERTIONS
//! ============================================================================

mod common;

use common::{assert_heaps_match_blocks, assert_no_overlap, VectorFixture, RANDOM_SEED};
use gma::{
    AllocationDesc, AllocationId, BlockVector, BlockVectorConfig, DefragmentationAlgorithm,
    DefragmentationConfig, DefragmentationContext, DefragmentationMove, DefragmentationState,
    DefragmentationStats, GmaError, MetadataAlgorithm, MoveOperation, ResourceDesc, ResourceType,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ALGORITHMS: [DefragmentationAlgorithm; 3] = [
    DefragmentationAlgorithm::Fast,
    DefragmentationAlgorithm::Balanced,
    DefragmentationAlgorithm::Full,
];

/// Four 4096-byte blocks, each left holding a single 1000-byte allocation
fn scattered_fixture(algorithm: MetadataAlgorithm) -> (VectorFixture, Vec<AllocationId>) {
    let fixture = VectorFixture::with_config(BlockVectorConfig {
        preferred_block_size: 4096,
        explicit_block_size: true,
        algorithm,
        ..Default::default()
    });
    let ids = fixture.allocate_many(16, 1000);
    assert_eq!(fixture.vector.block_count(), 4);

    let (keep, freed): (Vec<_>, Vec<_>) = ids.into_iter().enumerate().partition(|(i, _)| i % 4 == 0);
    fixture.free_all(freed.into_iter().map(|(_, id)| id));
    (fixture, keep.into_iter().map(|(_, id)| id).collect())
}

/// Run passes until the context reports nothing left, copying every move
///
/// `on_move` runs for each move before the pass is committed, standing in for
/// the caller's content copy.
fn run_to_completion(
    ctx: &mut DefragmentationContext<'_>,
    mut on_move: impl FnMut(&DefragmentationMove),
) -> usize {
    let mut passes = 0;
    loop {
        let moves = ctx.pass_begin().expect("pass_begin should succeed");
        if moves.is_empty() {
            break;
        }
        for mv in &moves {
            assert_eq!(mv.operation, MoveOperation::Copy);
            on_move(mv);
        }
        passes += 1;
        assert!(passes < 64, "defragmentation did not converge");
        if !ctx.pass_end(&moves).expect("pass_end should succeed") {
            break;
        }
    }
    assert_eq!(ctx.state(), DefragmentationState::Done);
    passes
}

fn defragment(vector: &BlockVector, config: DefragmentationConfig) -> (usize, DefragmentationStats) {
    let mut ctx = DefragmentationContext::for_vector(vector, config).unwrap();
    let passes = run_to_completion(&mut ctx, |_| {});
    (passes, ctx.stats())
}

/// ============================================================================
/// CONSERVATION
/// ============================================================================

/// Every algorithm compacts scattered allocations into one block
///
/// **Bug this finds:** Moves reserved but never committed, lost allocations
/// **Invariant verified:** Same ids, same bytes, no overlap, heaps released
#[test]
fn test_scattered_allocations_compact_into_first_block() {
    for metadata in [MetadataAlgorithm::Generic, MetadataAlgorithm::Tlsf] {
        for algorithm in ALGORITHMS {
            // Arrange
            let (fixture, live) = scattered_fixture(metadata);
            let before = fixture.statistics();

            // Act
            let (_, stats) = defragment(
                &fixture.vector,
                DefragmentationConfig {
                    algorithm,
                    ..Default::default()
                },
            );

            // Assert
            let context = format!("{:?}/{:?}", metadata, algorithm);
            let after = fixture.statistics();
            assert_eq!(after.allocation_count, before.allocation_count, "{}", context);
            assert_eq!(after.allocation_bytes, before.allocation_bytes, "{}", context);
            assert_eq!(stats.allocations_moved, 3, "{}", context);
            assert_eq!(stats.bytes_moved, 3000, "{}", context);
            assert_eq!(stats.heaps_freed, 2, "{}", context);
            assert_eq!(stats.bytes_freed, 2 * 4096, "{}", context);

            let infos = fixture.infos(&live);
            assert_no_overlap(&infos, &context);
            assert!(
                infos.iter().all(|info| info.block_id == infos[0].block_id),
                "{}: allocations still spread over blocks",
                context
            );
            assert_eq!(fixture.vector.block_count(), 2, "{}", context);
            assert_heaps_match_blocks(&fixture, &context);
            assert!(fixture.vector.validate(), "{}", context);

            fixture.free_all(live);
        }
    }
}

/// A per-pass allocation limit spreads the same work over more passes
///
/// **Bug this finds:** Limits ignored, or a pass ending with uncommitted work
#[test]
fn test_allocation_limit_splits_work_into_passes() {
    let (fixture, live) = scattered_fixture(MetadataAlgorithm::Tlsf);

    let (passes, stats) = defragment(
        &fixture.vector,
        DefragmentationConfig {
            algorithm: DefragmentationAlgorithm::Fast,
            max_allocations_per_pass: 1,
            ..Default::default()
        },
    );

    assert_eq!(passes, 3);
    assert_eq!(stats.allocations_moved, 3);
    assert_eq!(stats.heaps_freed, 2);
    assert_no_overlap(&fixture.infos(&live), "after limited passes");

    fixture.free_all(live);
}

/// Ignoring a move pins its block but later passes keep compacting the rest
///
/// **Bug this finds:** Context giving up after a pass whose moves were all ignored
/// **Invariant verified:** Ignored allocation stays put, the others still move
#[test]
fn test_ignored_move_does_not_end_defragmentation() {
    // Arrange
    let (fixture, live) = scattered_fixture(MetadataAlgorithm::Tlsf);
    let mut ctx = DefragmentationContext::for_vector(
        &fixture.vector,
        DefragmentationConfig {
            algorithm: DefragmentationAlgorithm::Fast,
            max_allocations_per_pass: 1,
            ..Default::default()
        },
    )
    .unwrap();

    // Act - decline the first move
    let mut moves = ctx.pass_begin().unwrap();
    assert_eq!(moves.len(), 1);
    let pinned = moves[0].src;
    let pinned_block = fixture.info(pinned).block_id;
    moves[0].operation = MoveOperation::Ignore;
    assert!(ctx.pass_end(&moves).unwrap(), "an ignored move must leave room for more passes");
    assert_eq!(ctx.state(), DefragmentationState::PassCommitted);

    run_to_completion(&mut ctx, |mv| assert_ne!(mv.src, pinned));
    let stats = ctx.stats();
    drop(ctx);

    // Assert
    assert_eq!(fixture.info(pinned).block_id, pinned_block);
    assert_eq!(stats.allocations_moved, 2);
    assert_eq!(stats.bytes_moved, 2000);
    assert_no_overlap(&fixture.infos(&live), "after ignored move");
    assert!(fixture.vector.validate());

    fixture.free_all(live);
}

/// Seeded fragmentation, then a full defragmentation
///
/// **Bug this finds:** Overlap introduced by in-block repacking
#[test]
fn test_random_fragmentation_defragments_safely() {
    for metadata in [MetadataAlgorithm::Generic, MetadataAlgorithm::Tlsf] {
        for algorithm in ALGORITHMS {
            // Arrange
            let fixture = VectorFixture::with_config(BlockVectorConfig {
                preferred_block_size: 16 * 1024,
                explicit_block_size: true,
                algorithm: metadata,
                ..Default::default()
            });
            let mut rng = StdRng::seed_from_u64(RANDOM_SEED);
            let mut live: Vec<AllocationId> = (0..300)
                .map(|_| fixture.allocate(rng.gen_range(16..1500), 1u64 << rng.gen_range(0..7u32)))
                .collect();
            for _ in 0..180 {
                let id = live.swap_remove(rng.gen_range(0..live.len()));
                fixture.vector.free(id).unwrap();
            }
            let before = fixture.statistics();
            let blocks_before = fixture.vector.block_count();

            // Act
            defragment(
                &fixture.vector,
                DefragmentationConfig {
                    algorithm,
                    ..Default::default()
                },
            );

            // Assert
            let context = format!("{:?}/{:?}", metadata, algorithm);
            let after = fixture.statistics();
            assert_eq!(after.allocation_count, before.allocation_count, "{}", context);
            assert_eq!(after.allocation_bytes, before.allocation_bytes, "{}", context);
            assert!(fixture.vector.block_count() <= blocks_before, "{}", context);

            let infos = fixture.infos(&live);
            assert_no_overlap(&infos, &context);
            for info in &infos {
                assert_eq!(info.offset % info.alignment, 0, "{}: {}", context, info.id);
            }
            assert!(fixture.vector.validate(), "{}", context);
            assert_heaps_match_blocks(&fixture, &context);

            fixture.free_all(live);
        }
    }
}

/// ============================================================================
/// RESOURCES AND MULTIPLE VECTORS
/// ============================================================================

/// Resources recreated at the destination replace the old ones
///
/// **Bug this finds:** Old resource leaked, or id left pointing at stale memory
#[test]
fn test_placed_resources_follow_their_allocation() {
    // Arrange
    let fixture = VectorFixture::with_config(BlockVectorConfig {
        preferred_block_size: 4096,
        explicit_block_size: true,
        ..Default::default()
    });
    let desc = ResourceDesc {
        resource_type: ResourceType::Buffer,
        size: 1000,
        alignment: 1,
    };
    let ids: Vec<_> = (0..16)
        .map(|_| fixture.vector.create_resource(&AllocationDesc::default(), &desc).unwrap().0)
        .collect();
    let (keep, freed): (Vec<_>, Vec<_>) = ids.into_iter().enumerate().partition(|(i, _)| i % 4 == 0);
    fixture.free_all(freed.into_iter().map(|(_, id)| id));
    let live: Vec<_> = keep.into_iter().map(|(_, id)| id).collect();

    // Act
    let mut ctx =
        DefragmentationContext::for_vector(&fixture.vector, DefragmentationConfig::default())
            .unwrap();
    run_to_completion(&mut ctx, |mv| {
        fixture
            .vector
            .create_placed_resource(mv.dst_tmp, &desc)
            .expect("destination must accept the resource");
    });
    drop(ctx);

    // Assert
    assert_eq!(fixture.device.live_resources(), live.len());
    for info in fixture.infos(&live) {
        let resource = info.resource.expect("moved allocation keeps a resource");
        assert_eq!(
            fixture.device.resource_placement(resource),
            Some((info.heap, info.offset, 1000))
        );
    }

    fixture.free_all(live);
    assert_eq!(fixture.device.live_resources(), 0);
}

/// One context drives several vectors
///
/// **Bug this finds:** Moves applied to the wrong vector
#[test]
fn test_context_spans_several_vectors() {
    let (generic, generic_live) = scattered_fixture(MetadataAlgorithm::Generic);
    let (tlsf, tlsf_live) = scattered_fixture(MetadataAlgorithm::Tlsf);

    let mut ctx = DefragmentationContext::new(
        &[&generic.vector, &tlsf.vector],
        DefragmentationConfig::default(),
    )
    .unwrap();
    let mut seen_vectors = [0usize; 2];
    run_to_completion(&mut ctx, |mv| seen_vectors[mv.vector] += 1);
    let stats = ctx.stats();
    drop(ctx);

    assert_eq!(seen_vectors, [3, 3]);
    assert_eq!(stats.allocations_moved, 6);
    assert_eq!(stats.heaps_freed, 4);
    for (fixture, live) in [(&generic, &generic_live), (&tlsf, &tlsf_live)] {
        assert_no_overlap(&fixture.infos(live), "multi-vector");
        assert!(fixture.vector.validate());
        assert_eq!(fixture.vector.block_count(), 2);
    }

    generic.free_all(generic_live);
    tlsf.free_all(tlsf_live);
}

/// ============================================================================
/// PROTOCOL
/// ============================================================================

/// Abandoning a pass releases every reserved destination
///
/// **Bug this finds:** Temporary allocations leaking past the context
#[test]
fn test_dropping_active_pass_releases_destinations() {
    let (fixture, live) = scattered_fixture(MetadataAlgorithm::Tlsf);
    let before = fixture.statistics();

    let mut ctx =
        DefragmentationContext::for_vector(&fixture.vector, DefragmentationConfig::default())
            .unwrap();
    let moves = ctx.pass_begin().unwrap();
    assert_eq!(moves.len(), 3);
    assert_eq!(fixture.vector.allocation_count(), live.len() + moves.len());
    drop(ctx);

    let after = fixture.statistics();
    assert_eq!(after.allocation_count, before.allocation_count);
    assert_eq!(fixture.vector.allocation_count(), live.len());
    assert!(fixture.vector.validate());

    fixture.free_all(live);
}

/// Linear vectors are rejected up front
#[test]
fn test_linear_vector_is_unsupported() {
    let fixture = VectorFixture::new(MetadataAlgorithm::Linear);
    let err =
        DefragmentationContext::for_vector(&fixture.vector, DefragmentationConfig::default())
            .unwrap_err();
    assert!(matches!(err, GmaError::Unsupported(_)));
}

/// Calling the pass functions out of order is an error, not a panic
#[test]
fn test_out_of_order_calls_are_rejected() {
    let (fixture, live) = scattered_fixture(MetadataAlgorithm::Generic);
    let mut ctx =
        DefragmentationContext::for_vector(&fixture.vector, DefragmentationConfig::default())
            .unwrap();

    assert!(matches!(ctx.pass_end(&[]), Err(GmaError::InvalidState { .. })));
    let moves = ctx.pass_begin().unwrap();
    assert!(matches!(ctx.pass_begin(), Err(GmaError::InvalidState { .. })));
    assert!(ctx.pass_end(&moves).unwrap());

    drop(ctx);
    fixture.free_all(live);
}
