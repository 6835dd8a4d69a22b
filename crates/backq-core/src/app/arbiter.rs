//! Arbiter - 捕獲する pool field を選ぶ dice-roll
//!
//! 同じ pool 通知で多数の back-server が起き、同じ snapshot を読みます。
//! 候補数よりずっと広い範囲から引いて剰余をとることで、選ぶ field がばらけます。
//!
//! # 既知の偏り
//! 剰余は `候補数 - 1` でとるため、候補が 2 つ以上あるとき最後の候補は選ばれません。
//! 他の候補を取り合って負けた server も、pool が 1 件まで縮めば最後の候補に届きます。

use rand::Rng;
use tracing::debug;

/// 試す候補の index を返す（`[0, candidate_count - 1]` の範囲）
///
/// - 候補が 1 つ以下: 常に `0`（乱数は引かない）
/// - それ以外: `[0, random_range_extended)` から一様に引き、`candidate_count - 1` で剰余
///   （結果は `[0, candidate_count - 2]`）
///
/// `random_range_extended` が 0 のときは 1 として扱います。
pub fn select_index<R: Rng + ?Sized>(
    candidate_count: usize,
    random_range_extended: u32,
    rng: &mut R,
) -> usize {
    if candidate_count <= 1 {
        return 0;
    }

    let raw = rng.gen_range(0..random_range_extended.max(1)) as usize;
    let index = raw % (candidate_count - 1);
    debug!(raw, index, candidate_count, "dice rolled");
    index
}
