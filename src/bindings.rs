//! Solidity ABI bindings for the token-bridge integration, the relayer
//! contract and the token bridge's message transmitter.

use alloy::sol;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface ICircleIntegration {
        function fetchLocalTokenAddress(uint32 sourceDomain, bytes32 sourceToken)
            external
            view
            returns (bytes32);
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface ICircleRelayer {
        struct RedeemParameters {
            bytes encodedWormholeMessage;
            bytes circleBridgeMessage;
            bytes circleAttestation;
        }

        function calculateNativeSwapAmountOut(address token, uint256 toNativeAmount)
            external
            view
            returns (uint256);

        function redeemTokens(RedeemParameters memory redeemParams) external payable;
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IMessageTransmitter {
        event MessageSent(bytes message);
    }
}
