/// Landmark pairs joined when drawing the 33-point pose skeleton.
pub const POSE_EDGES: [(usize, usize); 35] = [
    // face
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 7),
    (0, 4),
    (4, 5),
    (5, 6),
    (6, 8),
    (9, 10),
    // shoulders and left arm
    (11, 12),
    (11, 13),
    (13, 15),
    (15, 17),
    (15, 19),
    (15, 21),
    (17, 19),
    // right arm
    (12, 14),
    (14, 16),
    (16, 18),
    (16, 20),
    (16, 22),
    (18, 20),
    // torso and legs
    (11, 23),
    (12, 24),
    (23, 24),
    (23, 25),
    (24, 26),
    (25, 27),
    (26, 28),
    (27, 29),
    (28, 30),
    (29, 31),
    (30, 32),
    (27, 31),
    (28, 32),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointRegion {
    FaceAndShoulders,
    Arm,
    Leg,
}

pub fn joint_region(index: usize) -> JointRegion {
    match index {
        0..=12 => JointRegion::FaceAndShoulders,
        13..=22 => JointRegion::Arm,
        _ => JointRegion::Leg,
    }
}
